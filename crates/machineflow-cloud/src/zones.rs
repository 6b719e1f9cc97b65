//! Availability-zone selection

/// Resolve the zone the user asked for
///
/// The deprecated legacy field only fills in when the explicit field is
/// empty; it never overrides an explicit request.
pub fn requested_zone(explicit: Option<&str>, deprecated: Option<&str>) -> Option<String> {
    explicit
        .filter(|z| !z.is_empty())
        .or_else(|| deprecated.filter(|z| !z.is_empty()))
        .map(str::to_string)
}

/// Pick a zone for a machine from the zones its size supports
///
/// - no supported zones: `None`, zones simply do not apply
/// - requested and supported: the requested zone
/// - requested but unsupported: warn and fall back to the first supported zone
/// - nothing requested: the first supported zone
pub fn select_zone(requested: Option<&str>, supported: &[String]) -> Option<String> {
    let first = supported.first()?;

    match requested.filter(|z| !z.is_empty()) {
        Some(zone) if supported.iter().any(|s| s == zone) => Some(zone.to_string()),
        Some(zone) => {
            tracing::warn!(
                requested = zone,
                selected = %first,
                "requested availability zone is not supported for this size, using first available zone"
            );
            Some(first.clone())
        }
        None => {
            tracing::info!(
                selected = %first,
                "no availability zone requested, using first available zone"
            );
            Some(first.clone())
        }
    }
}
