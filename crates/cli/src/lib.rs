//! Client side of the podcost agent API

pub mod client;
pub mod commands;
pub mod output;
