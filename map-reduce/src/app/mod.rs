//! Applications shipped with the framework.

pub mod wc;
