// Configuration loading and validation
pub mod config;

// Encryption at rest and signed identity tokens
pub mod crypto;

// Shared transient cache (CSRF state, idempotency records, token mirrors)
pub mod cache;

// Persisted OAuth connections
pub mod connections;

// Provider wire clients
pub mod providers;

// OAuth flow orchestration
pub mod oauth;

// Secret masking for logs
pub mod redact;

// HTTP API
pub mod api;
