//! RFC 1071 Internet checksum.
//!
//! ICMPv4 covers only the message itself. UDP and ICMPv6 also cover a
//! pseudo-header built from the IP addresses, the upper-layer length and the
//! protocol number.

use std::net::IpAddr;

/// Sum `data` as big-endian 16-bit words on top of `initial`.
///
/// An odd trailing byte is the high byte of a final word.
fn sum_words(data: &[u8], initial: u64) -> u64 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    sum
}

fn fold(mut sum: u64) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// The folded, un-complemented one's-complement sum of `data`.
///
/// A buffer that already carries its correct checksum sums to `0xffff`.
pub fn ones_complement_sum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Internet checksum of `data`, to be written into a zeroed checksum field.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !ones_complement_sum(data)
}

/// Checksum over the IPv4 or IPv6 pseudo-header followed by `data`.
///
/// Returns `None` when `source` and `destination` are of different families.
pub fn pseudo_header_checksum(
    source: IpAddr,
    destination: IpAddr,
    protocol: u8,
    data: &[u8],
) -> Option<u16> {
    let length = data.len() as u64;
    let sum = match (source, destination) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            // src (4) + dst (4) + zero (1) + protocol (1) + length (2)
            let sum = sum_words(&src.octets(), 0);
            let sum = sum_words(&dst.octets(), sum);
            sum + protocol as u64 + (length & 0xffff)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            // src (16) + dst (16) + length (4) + zeros (3) + next header (1)
            let sum = sum_words(&src.octets(), 0);
            let sum = sum_words(&dst.octets(), sum);
            sum + (length >> 16) + (length & 0xffff) + protocol as u64
        }
        _ => return None,
    };
    Some(!fold(sum_words(data, sum)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn with_checksum(data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        out.extend_from_slice(&internet_checksum(data).to_be_bytes());
        out
    }

    #[test]
    fn test_rfc1071_example() {
        // Worked example from RFC 1071 section 3.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(ones_complement_sum(&data), 0xddf2);
        assert_eq!(internet_checksum(&data), 0x220d);
    }

    #[test]
    fn test_buffer_with_checksum_sums_to_all_ones() {
        let samples: [&[u8]; 4] = [
            &[],
            &[0xff, 0xff],
            &[0x08, 0x00, 0x00, 0x00, 0x30, 0x39, 0x00, 0x01],
            b"hoptrace-probe-payload",
        ];
        for data in samples {
            assert_eq!(ones_complement_sum(&with_checksum(data)), 0xffff, "{:?}", data);
        }
    }

    #[test]
    fn test_odd_length_padding_is_invariant() {
        let odd = [0x45, 0x00, 0x1c, 0xab, 0x7f];
        let mut padded = odd.to_vec();
        padded.push(0);
        assert_eq!(internet_checksum(&odd), internet_checksum(&padded));
    }

    #[test]
    fn test_single_bit_flip_changes_checksum() {
        let data = b"PythonTraceroute".to_vec();
        let original = internet_checksum(&data);
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data.clone();
                flipped[byte] ^= 1 << bit;
                assert_ne!(internet_checksum(&flipped), original);
            }
        }
    }

    #[test]
    fn test_carry_folding() {
        // 0xffff + 0xffff + 0x0002 = 0x20000, whose carry folds back to 0x0002
        let data = [0xff, 0xff, 0xff, 0xff, 0x00, 0x02];
        assert_eq!(ones_complement_sum(&data), 0x0002);
    }

    #[test]
    fn test_pseudo_header_v4_verifies() {
        let src = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 10));
        let dst = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        let mut udp = vec![0x80, 0x01, 0x82, 0x9a, 0x00, 0x0c, 0x00, 0x00, b'a', b'b', b'c', b'd'];
        let csum = pseudo_header_checksum(src, dst, 17, &udp).unwrap();
        udp[6..8].copy_from_slice(&csum.to_be_bytes());

        let mut pseudo = Vec::new();
        pseudo.extend_from_slice(&[192, 168, 0, 10, 8, 8, 8, 8, 0, 17]);
        pseudo.extend_from_slice(&(udp.len() as u16).to_be_bytes());
        pseudo.extend_from_slice(&udp);
        assert_eq!(ones_complement_sum(&pseudo), 0xffff);
    }

    #[test]
    fn test_pseudo_header_v6_verifies() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let mut icmp = vec![128, 0, 0, 0, 0x12, 0x34, 0x00, 0x01, 1, 2, 3];
        let csum = pseudo_header_checksum(src.into(), dst.into(), 58, &icmp).unwrap();
        icmp[2..4].copy_from_slice(&csum.to_be_bytes());

        let mut pseudo = Vec::new();
        pseudo.extend_from_slice(&src.octets());
        pseudo.extend_from_slice(&dst.octets());
        pseudo.extend_from_slice(&(icmp.len() as u32).to_be_bytes());
        pseudo.extend_from_slice(&[0, 0, 0, 58]);
        pseudo.extend_from_slice(&icmp);
        pseudo.push(0);
        assert_eq!(ones_complement_sum(&pseudo), 0xffff);
    }

    #[test]
    fn test_pseudo_header_rejects_mixed_families() {
        let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(pseudo_header_checksum(v4, v6, 17, &[]), None);
    }
}
