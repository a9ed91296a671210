pub mod integrity;
pub mod session_store;
pub mod storage_client;
pub mod sweeper;
pub mod upload_coordinator;
