//! Policy implementations.
//!
//! The connection handler only sees the [`PolicyEvaluator`] trait; this
//! module holds the evaluator the binary wires in.
//!
//! [`PolicyEvaluator`]: crate::proxy::decision::PolicyEvaluator

pub mod api_key;

pub use api_key::ApiKeyPolicy;
