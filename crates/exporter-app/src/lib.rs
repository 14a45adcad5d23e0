mod config;

pub use config::ExporterConfig;
