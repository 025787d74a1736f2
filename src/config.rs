//! Server configuration: defaults overridable by `key=value` pairs.

use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

/// Default USB/IP TCP port.
pub const DEFAULT_PORT: u16 = 3240;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Address the listener binds.
    pub address: IpAddr,
    /// Port the listener binds.
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
        }
    }
}

impl Config {
    /// Layer `key=value` overrides on top of `self`. Unknown keys and
    /// unparsable values are rejected, naming the offender.
    pub fn apply_overrides<'a, I>(&mut self, pairs: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for pair in pairs {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(ConfigError::NotKeyValue(pair.to_owned()));
            };
            match key {
                "address" => {
                    self.address = value
                        .parse()
                        .map_err(|_| ConfigError::invalid(key, value))?;
                }
                "port" => {
                    self.port = value
                        .parse()
                        .map_err(|_| ConfigError::invalid(key, value))?;
                }
                _ => return Err(ConfigError::UnknownKey(key.to_owned())),
            }
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    NotKeyValue(String),
    UnknownKey(String),
    InvalidValue { key: String, value: String },
}

impl ConfigError {
    fn invalid(key: &str, value: &str) -> ConfigError {
        ConfigError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
        }
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotKeyValue(arg) => write!(f, "expected key=value, got {arg:?}"),
            ConfigError::UnknownKey(key) => write!(f, "unknown configuration key {key:?}"),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value {value:?} for {key}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
