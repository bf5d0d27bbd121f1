/// Tab-switch counter state as reported back to the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TabSwitchStatus {
    pub(crate) count: i32,
    pub(crate) flagged: bool,
}

impl TabSwitchStatus {
    pub(crate) fn new(count: i32, threshold: u32) -> Self {
        Self { count, flagged: is_flagged(count, threshold) }
    }

    /// True only for the increment that first crosses the threshold.
    pub(crate) fn just_flagged(self, threshold: u32) -> bool {
        self.flagged && !is_flagged(self.count - 1, threshold)
    }
}

pub(crate) fn is_flagged(count: i32, threshold: u32) -> bool {
    i64::from(count) >= i64::from(threshold)
}
