//! Host-side tooling around the embedded engine: raw-CSV ingestion into the
//! engine's artifact family, plus the report printing used by the inspect
//! binary.

pub mod ingest;
