use std::{net::TcpListener, ops::RangeInclusive};

pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 40000..=50000;

/// Binds and immediately releases the port.
pub fn port_is_free(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => {
            drop(l);
            true
        }
        Err(_) => false,
    }
}

/// First port in `range` that binds cleanly, or `None` once the range is exhausted.
pub fn find_free_port(range: RangeInclusive<u16>) -> Option<u16> {
    find_free_port_with(range, port_is_free)
}

pub fn find_free_port_with(
    range: RangeInclusive<u16>,
    mut probe: impl FnMut(u16) -> bool,
) -> Option<u16> {
    range.into_iter().find(|p| probe(*p))
}
