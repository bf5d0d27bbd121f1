pub(crate) mod answer_codec;
pub(crate) mod anti_cheat;
pub(crate) mod countdown;
#[cfg(test)]
pub(crate) mod memory_store;
pub(crate) mod scoring;
pub(crate) mod session_client;
pub(crate) mod session_lifecycle;
pub(crate) mod session_timer;
pub(crate) mod store;
