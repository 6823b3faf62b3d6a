//! Utility items used across the kernel.
//!
//! **This module is exempt from the API stability guarantee.** It's exposed
//! only because it's needed by the configuration macros.
mod init;
pub use self::init::Init;
