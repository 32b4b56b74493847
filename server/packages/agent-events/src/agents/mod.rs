//! Decoders from hosted agent wire formats into [`crate::RunEvent`].

pub mod responses;
