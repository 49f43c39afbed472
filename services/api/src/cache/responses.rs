use serde::Serialize;
use tally_db::cache::models::CachedEntry;

#[derive(Debug, Serialize)]
pub struct CachedEntryResponse {
    pub data: CachedEntry,
}

#[derive(Debug, Serialize)]
pub struct CachedListResponse {
    pub data: Vec<CachedEntry>,
    pub count: usize,
}
