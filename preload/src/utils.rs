use std::fs::File;
use std::io::{self, Read};

pub type HashMap<K, V> = hashbrown::HashMap<K, V, ahash::random_state::RandomState>;
pub type Entry<'a, K, V> = hashbrown::hash_map::Entry<'a, K, V, ahash::random_state::RandomState>;
pub const fn empty_hashmap<K, V>() -> HashMap<K, V> {
    hashbrown::HashMap::with_hasher(ahash::random_state::RandomState::with_seeds(
        0x9a3c81b7d46e5f02,
        0x5d71c04f8be2a693,
        0x143fd0a95c2e87b1,
        0x6e0b92c4175fad38,
    ))
}

pub fn read_file(path: &str) -> io::Result<Vec<u8>> {
    let mut fp = File::open(path)?;
    let mut buffer = Vec::new();
    fp.read_to_end(&mut buffer)?;
    Ok(buffer)
}

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// Formats a byte count the way the report prints sizes: the dominant unit
/// followed by the remainder in the next unit down, e.g. `3.512 MB`.
pub fn format_bytes(size: u64) -> String {
    let mb = size / MB;
    let kb = (size % MB) / KB;
    let bytes = size % KB;

    if mb > 0 {
        format!("{}.{} MB", mb, kb)
    } else if kb > 0 {
        format!("{}.{} KB", kb, bytes)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Formats a nanosecond interval with the two most significant units.
pub fn format_duration(nanos: u64) -> String {
    let hours = nanos / 3_600_000_000_000;
    let mins = (nanos / 60_000_000_000) % 60;
    let secs = (nanos / 1_000_000_000) % 60;
    let millis = (nanos / 1_000_000) % 1_000;
    let micros = (nanos / 1_000) % 1_000;
    let ns = nanos % 1_000;

    if hours > 0 {
        format!("{} hours {} mins", hours, mins)
    } else if mins > 0 {
        format!("{} mins {} secs", mins, secs)
    } else if secs > 0 {
        format!("{}.{} secs", secs, millis)
    } else if millis > 0 {
        format!("{}.{} ms", millis, micros)
    } else if micros > 0 {
        format!("{}.{} us", micros, ns)
    } else {
        format!("{} ns", ns)
    }
}

pub struct ProcessMemory {
    pub vss: u64,
    pub rss: u64,
    pub shared: u64,
}

fn parse_statm(raw: &str, page_size: u64) -> Option<ProcessMemory> {
    let mut fields = raw.split_whitespace();
    let vss: u64 = fields.next()?.parse().ok()?;
    let rss: u64 = fields.next()?.parse().ok()?;
    let shared: u64 = fields.next()?.parse().ok()?;

    Some(ProcessMemory {
        vss: vss * page_size,
        rss: rss * page_size,
        shared: shared * page_size,
    })
}

pub fn read_statm() -> Option<ProcessMemory> {
    let raw = read_file("/proc/self/statm").ok()?;
    let raw = std::str::from_utf8(&raw).ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    parse_statm(raw, page_size)
}

pub fn read_comm() -> String {
    read_file("/proc/self/comm")
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .map(|comm| comm.trim().to_owned())
        .unwrap_or_else(|| "?".to_owned())
}
