use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Signing key for non-strict environments when `SECRET_KEY` is absent.
///
/// Tokens signed with it do not survive a restart.
pub(super) fn ephemeral_secret_key() -> String {
    tracing::warn!("SECRET_KEY is not set; using an ephemeral signing key for this process");
    let mut bytes = [0u8; 48];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
