use tracing_subscriber::EnvFilter;

use crate::device::Device;

pub fn tracing_subscriber_init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Must run once before any session is created; every session picks up the
/// execution providers committed here.
pub fn ort_init(device: Device) -> Result<(), ort::Error> {
    ort::init()
        .with_name("fitzpatrick-serve")
        .with_execution_providers(device.execution_providers())
        .commit()
}
