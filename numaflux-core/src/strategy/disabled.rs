use log::info;

/// Tracking stays active; placement never happens.
pub(super) fn start() {
    info!("Mode 'disabled': memory is tracked but never moved");
}
