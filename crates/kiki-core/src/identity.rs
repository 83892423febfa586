//! Per-node identity and the deployment region key
//!
//! The data directory holds `identity.json` (the node's key pair, written
//! once) and `settings.json`. The region key is shared by every node in a
//! deployment and is derived from a built-in seed unless settings override it.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::crypto::KeyPair;
use crate::error::KikiResult;
use crate::settings::Settings;

pub const IDENTITY_FILE: &str = "identity.json";
pub const SETTINGS_FILE: &str = "settings.json";
pub const DATABASE_FILE: &str = "kiki.redb";

/// Private seed of the default deployment region.
const REGION_SEED: [u8; 32] = [
    0x6b, 0x69, 0x6b, 0x69, 0x2d, 0x72, 0x65, 0x67, 0x69, 0x6f, 0x6e, 0x2d, 0x30, 0x31, 0x9e, 0x37,
    0x52, 0xa1, 0x0c, 0xd4, 0x7f, 0x18, 0xe2, 0x55, 0x3b, 0xc6, 0x91, 0x04, 0xaf, 0x6d, 0x28, 0xf3,
];

/// The built-in region key.
pub fn default_region() -> KeyPair {
    KeyPair::from_secret_bytes(REGION_SEED)
}

/// Everything a feed operation needs to know about who it runs as.
///
/// Passed explicitly so that several nodes can live in one process.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub identity: KeyPair,
    pub region: KeyPair,
    pub settings: Settings,
}

impl NodeContext {
    pub fn new(identity: KeyPair, region: KeyPair, settings: Settings) -> Self {
        Self {
            identity,
            region,
            settings,
        }
    }

    pub fn is_self(&self, public: &str) -> bool {
        self.identity.public() == public
    }
}

/// Result of loading (or creating) the data directory.
#[derive(Debug)]
pub struct Setup {
    pub context: NodeContext,
    pub database_path: PathBuf,
    /// True when `identity.json` did not exist before this call
    pub first_start: bool,
}

/// Load identity and settings from `data_dir`, creating them on first start.
pub fn setup(data_dir: &Path) -> KikiResult<Setup> {
    std::fs::create_dir_all(data_dir)?;

    let identity_path = data_dir.join(IDENTITY_FILE);
    let first_start = !identity_path.exists();
    let identity = if first_start {
        let identity = KeyPair::generate()?;
        std::fs::write(&identity_path, serde_json::to_vec_pretty(&identity)?)?;
        info!(public = %identity.public(), "created identity");
        identity
    } else {
        serde_json::from_slice(&std::fs::read(&identity_path)?)?
    };

    let settings_path = data_dir.join(SETTINGS_FILE);
    let settings = if settings_path.exists() {
        Settings::load(&settings_path)?
    } else {
        let settings = Settings::default();
        settings.save(&settings_path)?;
        settings
    };

    let region = settings.region.clone().unwrap_or_else(default_region);
    info!(
        identity = %identity.public(),
        region = %region.public(),
        ?data_dir,
        "loaded node identity"
    );

    Ok(Setup {
        context: NodeContext::new(identity, region, settings),
        database_path: data_dir.join(DATABASE_FILE),
        first_start,
    })
}
