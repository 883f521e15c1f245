//! All Paths are recorded here for use throughout this codebase
pub mod base {
    pub const ROOT: &str = "/";
    pub const HEALTH: &str = "/health";
    pub const ABOUT: &str = "/about";
}

pub mod kvstore {
    /// GET `?keys=a,b` reads keys, POST merges a batch of records
    pub const KEYS: &str = "/areas/{area}/keys";
    pub const KEYS_FILTERED: &str = "/areas/{area}/keys/filtered";
    pub const HASHES_FILTERED: &str = "/areas/{area}/hashes/filtered";
    /// PUT sets, DELETE stops refreshing
    pub const LOCAL_KEY: &str = "/areas/{area}/local/{key}";
    /// GET `?areas=a,b`
    pub const SUMMARY: &str = "/summary";
    /// Server-Sent Events stream
    pub const SUBSCRIBE: &str = "/subscribe";
}

pub mod peers {
    pub const PEERS: &str = "/areas/{area}/peers";
    pub const PEER: &str = "/areas/{area}/peers/{name}";
}

pub mod flood {
    pub const DUAL: &str = "/areas/{area}/flood/dual";
    pub const ROOT_CHILD: &str = "/areas/{area}/flood/child";
    pub const SPANNING_TREE: &str = "/areas/{area}/flood/spanning-tree";
}

fn fill(template: &str, area: &str) -> String {
    template.replace("{area}", area)
}

pub fn keys_path(area: &str) -> String {
    fill(kvstore::KEYS, area)
}

pub fn keys_filtered_path(area: &str) -> String {
    fill(kvstore::KEYS_FILTERED, area)
}

pub fn hashes_filtered_path(area: &str) -> String {
    fill(kvstore::HASHES_FILTERED, area)
}

pub fn local_key_path(area: &str, key: &str) -> String {
    fill(kvstore::LOCAL_KEY, area).replace("{key}", key)
}

pub fn peers_path(area: &str) -> String {
    fill(peers::PEERS, area)
}

pub fn peer_path(area: &str, name: &str) -> String {
    fill(peers::PEER, area).replace("{name}", name)
}

pub fn spanning_tree_path(area: &str) -> String {
    fill(flood::SPANNING_TREE, area)
}
