//! WAL login constants
//!
//! Identify the public companion app client. Not secrets: the secrets are the
//! persona access token and the session tickets minted from it.

/// WAL endpoint that exchanges a persona access token for a session ticket
pub const WAL_LOGIN_ENDPOINT: &str =
    "https://wal2.tools.gos.bio-iad.ea.com/wal/authentication/login";

/// Product the session ticket is issued for
pub const DEFAULT_PRODUCT_NAME: &str = "madden-2026-xbsx-mca";

/// Blaze service identifier sent as `X-BLAZE-ID`
pub const DEFAULT_BLAZE_ID: &str = "madden-2026-xbsx-gen5";

/// Application key sent as `X-Application-Key`
pub const APPLICATION_KEY: &str = "MADDEN-MCA";

/// User-Agent of the Android companion app
pub const USER_AGENT: &str =
    "Dalvik/2.1.0 (Linux; U; Android 13; Android SDK built for x86_64 Build/TE1A.220922.034)";

/// Message auth type observed in captured traffic (0x01040001)
pub const DEFAULT_AUTH_TYPE: u32 = 17_039_361;

/// Upper bound on a minted bundle's lifetime when the access token carries
/// no usable `exp` claim.
pub const DEFAULT_TICKET_LIFETIME_SECS: u64 = 3600;
