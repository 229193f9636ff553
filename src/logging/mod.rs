//! Audit logging

pub mod audit;

pub use audit::{AuditEvent, AuditEventType, AuditLog};
