// Library interface for the CDN DNSSEC key manager
// Allows integration testing of the HTTP handlers

pub mod dnssec;
