pub mod background;
pub mod blob_store;
pub mod cleanup;
pub mod error;
pub mod expiry;
pub mod mailer;
pub mod notification_worker;
pub mod notifier;
pub mod object_gateway;
pub mod queue;
pub mod quota;
pub mod transfer_service;
pub mod transfer_store;
