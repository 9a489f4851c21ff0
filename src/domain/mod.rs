//! Domain layer public interface.
//!
//! Backend-independent router abstractions. Nothing here refers to a
//! concrete broker or client library.
//!
//! All domain consumers import symbols via this module, not by referencing
//! individual files directly.

mod router;

// --- Router domain re-exports ---

pub use router::{
    //
    Connect,
    DeliveryFn,
    Router,
    RouterBase,
    RouterExt,
    RouterPtr,
};
