//! Stateright Model Checking
//!
//! Exhaustive state-space exploration of the acknowledgement protocol,
//! complementing the seeded simulation in [`crate::dst`]: the DST harness
//! samples long executions, the model covers every interleaving of a small one.
//!
//! ## Running Model Checks
//!
//! ```bash
//! # Larger configurations are #[ignore]d
//! cargo test stateright_ack_protocol -- --ignored --nocapture
//! ```
//!
//! | Model | Key Invariants |
//! |-------|----------------|
//! | `AckProtocolModel` | no_double_settle, no_premature_ack, ack_implies_committed, no_loss |

pub mod ack_protocol;

pub use ack_protocol::{AckProtocolConfig, AckProtocolModel};
