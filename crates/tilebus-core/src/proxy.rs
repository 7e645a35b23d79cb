//! Explicit registry of tile proxies
//!
//! A tile reports a six-character module name through its status RPC. The
//! hardware manager looks that name up here to decide which proxy type wraps
//! the tile. Proxies are registered explicitly by whoever provides them.

use std::collections::HashMap;
use std::fmt;

use crate::rpc::{RpcRequest, RpcResponse};
use crate::{Result, TileBusError};

/// RPC id of the status query every tile implements
pub const STATUS_RPC: u16 = 0x0004;

/// Module name reported by a tile without application firmware
pub const NO_APP_NAME: &str = "NO APP";

// ----------------------------------------------------------------------------
// Tile Information
// ----------------------------------------------------------------------------

/// Identity reported by a tile's status RPC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileInfo {
    pub address: u8,
    pub hw_type: u16,
    pub name: String,
    pub version: (u8, u8, u8),
    pub status: u8,
}

impl TileInfo {
    /// Build the status request for a tile
    pub fn request(address: u8) -> RpcRequest {
        RpcRequest::from_id(address, STATUS_RPC)
    }

    /// Parse the status RPC result (`hw_type:u16, name:[u8;6], major, minor, patch, status`)
    pub fn parse(address: u8, response: &RpcResponse) -> Result<Self> {
        let data = &response.payload;
        if data.len() < 11 {
            return Err(TileBusError::decode(format!(
                "Tile status response from address {} has {} bytes, expected 11",
                address,
                data.len()
            )));
        }

        let name = String::from_utf8_lossy(&data[2..8])
            .trim_end_matches(['\0', ' '])
            .to_string();

        Ok(Self {
            address,
            hw_type: u16::from_le_bytes([data[0], data[1]]),
            name,
            version: (data[8], data[9], data[10]),
            status: data.get(11).copied().unwrap_or(0),
        })
    }
}

impl fmt::Display for TileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor, patch) = self.version;
        write!(
            f,
            "{} v{}.{}.{} at address {}",
            self.name, major, minor, patch, self.address
        )
    }
}

// ----------------------------------------------------------------------------
// Proxy Types
// ----------------------------------------------------------------------------

/// Typed wrapper around one tile
pub trait TileProxy: Send + Sync {
    /// Tile info the proxy was created from
    fn info(&self) -> &TileInfo;

    /// Address the proxy talks to
    fn address(&self) -> u8 {
        self.info().address
    }

    /// Build a request addressed to this tile
    fn request(&self, rpc_id: u16) -> RpcRequest {
        RpcRequest::from_id(self.address(), rpc_id)
    }
}

/// Proxy used for tiles with no more specific registration
#[derive(Debug, Clone)]
pub struct GenericTile {
    info: TileInfo,
}

impl GenericTile {
    pub fn create(info: TileInfo) -> Box<dyn TileProxy> {
        Box::new(Self { info })
    }
}

impl TileProxy for GenericTile {
    fn info(&self) -> &TileInfo {
        &self.info
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Constructor for a proxy type
pub type ProxyFactory = fn(TileInfo) -> Box<dyn TileProxy>;

/// Maps tile module names to proxy constructors
pub struct ProxyRegistry {
    factories: HashMap<String, ProxyFactory>,
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(NO_APP_NAME, GenericTile::create);
        registry
    }
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a proxy for a module name; returns false if one already existed
    ///
    /// The first registration for a name wins.
    pub fn register(&mut self, module_name: &str, factory: ProxyFactory) -> bool {
        if self.factories.contains_key(module_name) {
            return false;
        }
        self.factories.insert(module_name.to_string(), factory);
        true
    }

    /// Whether a proxy exists for the given name
    pub fn contains(&self, module_name: &str) -> bool {
        self.factories.contains_key(module_name)
    }

    /// Build the proxy matching the tile's reported name
    pub fn create(&self, info: TileInfo) -> Result<Box<dyn TileProxy>> {
        match self.factories.get(&info.name) {
            Some(factory) => Ok(factory(info)),
            None => Err(TileBusError::UnknownProxy { name: info.name }),
        }
    }
}
