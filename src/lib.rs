#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod error;
pub mod gateway;
pub mod intents;
pub mod rest;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use crate::gateway::{Config, Gateway, GatewayEvent, GatewayState};
pub use crate::intents::Intents;
pub use crate::rest::{Bootstrap, BootstrapInfo, RestBootstrap};
