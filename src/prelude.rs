pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use tokio::sync::{broadcast, mpsc};

pub use std::io::Write;
pub use std::str::FromStr;

pub use crate::channels::Channels;
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::options::Options;
pub use crate::rct::{self, frame::ObjectId, registry::Registry, value::Value};
pub use crate::sink::{self, StateSink};
pub use crate::stats::{ConnectionStats, SharedStats};
pub use crate::{file_error, file_error_with_source, mqtt};
