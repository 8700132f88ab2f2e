pub mod app;
pub mod cache;
pub mod cel;
pub mod client;
pub mod config;
pub mod eval;
pub mod http;
pub mod pipeline;
pub mod serdes;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod template;
pub mod types;

pub use std::collections::{BTreeMap, HashMap, HashSet};
pub use std::fmt::{Debug, Display};
pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
pub use std::sync::Arc;
pub use std::time::{Duration, Instant, SystemTime};

pub use anyhow::Context as _;
pub use bytes::Bytes;
pub use serde::{Deserialize, Serialize, Serializer};
pub use tracing::{debug, error, info, trace, warn};

pub use crate::types::Outcome;
