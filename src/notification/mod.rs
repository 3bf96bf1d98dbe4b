//! Outbound notification providers.
//!
//! Each provider implements [`crate::core::AlertDispatcher`], so the relay
//! pipeline never touches a provider's wire protocol directly and a
//! provider can be swapped (or faked in tests) without touching the
//! pipeline.
pub mod sms;
