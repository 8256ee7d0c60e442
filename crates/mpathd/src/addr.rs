//! Core identifiers and the shared endpoint key.
//!
//! The kernel names a live MPTCP connection with a 32-bit token and a
//! local endpoint with an 8-bit address id; both reserve zero as
//! "absent", which maps naturally onto `NonZero` newtypes here. The
//! [`Endpoint`] type is the shared hash/ordering key used by the
//! address-id manager and the policies: hashing covers the address bytes
//! and, only when nonzero, the port; ordering puts every IPv4 endpoint
//! before every IPv6 endpoint.

use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroU8};
use std::sync::OnceLock;

/// Kernel-assigned identifier for a live MPTCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(NonZeroU32);

impl Token {
    /// Wrap a raw token value. Zero is reserved as "absent".
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Get the raw wire value.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0.get())
    }
}

/// MPTCP address id, in `[1, 255]`. Zero is reserved as "invalid".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddrId(NonZeroU8);

impl AddrId {
    /// Wrap a raw id. Zero is reserved as "invalid".
    pub fn new(raw: u8) -> Option<Self> {
        NonZeroU8::new(raw).map(Self)
    }

    /// Get the raw wire value.
    pub fn get(self) -> u8 {
        self.0.get()
    }
}

impl fmt::Display for AddrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An IPv4 or IPv6 endpoint with an optional port (0 = unspecified).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    addr: IpAddr,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from an address and port.
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// The IP address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// The port; 0 means unspecified.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Copy of this endpoint with a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            addr: self.addr,
            port,
        }
    }

    /// The address family as an `AF_*` constant.
    pub fn family(&self) -> u8 {
        match self.addr {
            IpAddr::V4(_) => libc::AF_INET as u8,
            IpAddr::V6(_) => libc::AF_INET6 as u8,
        }
    }

    /// True when both endpoints name the same host, ignoring ports.
    pub fn same_host(&self, other: &Endpoint) -> bool {
        self.addr == other.addr
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(a) => write!(f, "{}:{}", a, self.port),
            IpAddr::V6(a) => write!(f, "[{}]:{}", a, self.port),
        }
    }
}

impl From<IpAddr> for Endpoint {
    fn from(addr: IpAddr) -> Self {
        Self { addr, port: 0 }
    }
}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.addr {
            IpAddr::V4(a) => state.write(&a.octets()),
            IpAddr::V6(a) => state.write(&a.octets()),
        }
        // A zero port is "unspecified" and excluded from the key so that
        // port-less constructions of the same address hash identically.
        if self.port != 0 {
            state.write(&self.port.to_be_bytes());
        }
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // IpAddr orders IPv4 before IPv6, then byte-lexicographically
        // within a family; the port is the final tie-break.
        self.addr
            .cmp(&other.addr)
            .then(self.port.cmp(&other.port))
    }
}

/// Seed shared by every hasher in the process.
///
/// Derived once from the monotonic clock xor a kernel-supplied random
/// word. Sharing the seed across id-manager instances is fine: each
/// instance owns its own map.
fn process_seed() -> u32 {
    static SEED: OnceLock<u32> = OnceLock::new();
    *SEED.get_or_init(|| {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: clock_gettime writes into the provided timespec.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        let mut random: u32 = 0;
        // SAFETY: getrandom fills the provided buffer; a short or failed
        // read leaves the zero initialiser in place.
        unsafe {
            libc::getrandom(
                &mut random as *mut u32 as *mut libc::c_void,
                std::mem::size_of::<u32>(),
                libc::GRND_NONBLOCK,
            );
        }
        (ts.tv_nsec as u32 ^ ts.tv_sec as u32) ^ random
    })
}

/// `BuildHasher` producing seeded 32-bit MurmurHash3 hashers.
#[derive(Debug, Clone, Copy)]
pub struct SeededMurmur {
    seed: u32,
}

impl SeededMurmur {
    /// Build with an explicit seed (tests).
    pub fn with_seed(seed: u32) -> Self {
        Self { seed }
    }
}

impl Default for SeededMurmur {
    fn default() -> Self {
        Self {
            seed: process_seed(),
        }
    }
}

impl BuildHasher for SeededMurmur {
    type Hasher = Murmur3Hasher;

    fn build_hasher(&self) -> Murmur3Hasher {
        Murmur3Hasher {
            seed: self.seed,
            buf: Vec::with_capacity(18),
        }
    }
}

/// Streaming wrapper around [`murmur3_32`].
///
/// Keys fed through this hasher are at most an IPv6 address plus a port,
/// so buffering the writes and hashing on `finish` costs nothing.
#[derive(Debug)]
pub struct Murmur3Hasher {
    seed: u32,
    buf: Vec<u8>,
}

impl Hasher for Murmur3Hasher {
    fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn finish(&self) -> u64 {
        murmur3_32(&self.buf, self.seed) as u64
    }
}

/// 32-bit MurmurHash3 over `data` with the given seed.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, b) in tail.iter().enumerate() {
            k |= (*b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(s: &str, port: u16) -> Endpoint {
        Endpoint::new(s.parse::<Ipv4Addr>().unwrap().into(), port)
    }

    fn v6(s: &str, port: u16) -> Endpoint {
        Endpoint::new(s.parse::<Ipv6Addr>().unwrap().into(), port)
    }

    fn hash_of(e: &Endpoint, seed: u32) -> u64 {
        let build = SeededMurmur::with_seed(seed);
        let mut h = build.build_hasher();
        e.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_token_zero_reserved() {
        assert!(Token::new(0).is_none());
        assert_eq!(Token::new(0x12345678).unwrap().get(), 0x12345678);
        assert!(AddrId::new(0).is_none());
        assert_eq!(AddrId::new(255).unwrap().get(), 255);
    }

    #[test]
    fn test_murmur3_reference_vectors() {
        // Published reference vectors for MurmurHash3 x86 32-bit.
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e28b7);
        assert_eq!(murmur3_32(b"hello", 0), 0x248bfa47);
        assert_eq!(murmur3_32(b"test", 0x9747b28c), 0x704b81dc);
        assert_eq!(murmur3_32(b"Hello, world!", 0x9747b28c), 0x24884cba);
    }

    #[test]
    fn test_family_ordering() {
        let a = v4("203.0.113.9", 443);
        let b = v6("::1", 0);
        assert!(a < b, "every IPv4 endpoint orders before every IPv6");

        let c = v4("192.0.2.1", 0);
        let d = v4("192.0.2.2", 0);
        assert!(c < d);

        // Port is the last tie-break.
        assert!(v4("192.0.2.1", 1) < v4("192.0.2.1", 2));
    }

    #[test]
    fn test_zero_port_excluded_from_hash() {
        let bare = Endpoint::from(IpAddr::from(Ipv4Addr::new(192, 0, 2, 1)));
        let explicit = v4("192.0.2.1", 0);
        assert_eq!(hash_of(&bare, 7), hash_of(&explicit, 7));

        // A nonzero port feeds the hash.
        assert_ne!(hash_of(&bare, 7), hash_of(&v4("192.0.2.1", 80), 7));
    }

    #[test]
    fn test_seed_changes_hash() {
        let e = v6("2001:db8::1", 8080);
        assert_ne!(hash_of(&e, 1), hash_of(&e, 2));
    }

    #[test]
    fn test_same_host() {
        assert!(v4("192.0.2.1", 80).same_host(&v4("192.0.2.1", 9000)));
        assert!(!v4("192.0.2.1", 80).same_host(&v4("192.0.2.2", 80)));
    }

    #[test]
    fn test_display() {
        assert_eq!(v4("192.0.2.1", 80).to_string(), "192.0.2.1:80");
        assert_eq!(v6("2001:db8::1", 443).to_string(), "[2001:db8::1]:443");
        assert_eq!(Token::new(0x1234).unwrap().to_string(), "0x00001234");
    }
}
