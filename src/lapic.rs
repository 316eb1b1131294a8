//! Local APIC boundary.
//!
//! The APIC driver itself (timer programming, IPI send, startup-IPI
//! sequencing) is out of scope here, same as the other device drivers
//! named here: the core only consumes `lapicid` (to learn
//! which CPU it is running on) and `lapiceoi` (to acknowledge a handled
//! interrupt). A production build links this crate against the real
//! APIC driver instead of the stand-ins below.

/// This CPU's local APIC id, used to index [`crate::proc::mycpu`].
///
/// # Safety
/// Must be called with interrupts disabled so the result cannot become
/// stale mid-use if the calling thread migrates (it never does on this
/// kernel, but the precondition matches the original `lapicid`).
pub unsafe fn lapicid() -> u8 {
    0
}

/// Acknowledge the interrupt currently being serviced.
pub fn lapiceoi() {}
