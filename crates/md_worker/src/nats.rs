mod upload_event_service;

pub use upload_event_service::*;
