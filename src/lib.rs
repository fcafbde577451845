#![warn(clippy::pedantic)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::wildcard_imports)]

//! A split-horizon DNS responder: names under one authoritative
//! suffix are answered from an in-memory Name Table, everything else
//! is forwarded to an upstream resolver and relayed verbatim.

pub mod client;
pub mod hosts;
pub mod metrics;
pub mod name_table;
pub mod net_util;
pub mod protocol;
pub mod responder;
pub mod server;
pub mod settings;
pub mod upstream;
