// =============================================================================
// xv64 — Bare-Metal Support
// =============================================================================
//
// Pieces only a freestanding build needs. Hosted builds get these from std.
// =============================================================================

mod panic;
