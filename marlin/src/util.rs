use std::io::Error;
use std::io::Read;
use std::io::Write;
use xxhash_rust::xxh32::xxh32;

const HASH_SEED: u32 = 0;

#[inline]
pub fn write_vint(write: &mut dyn Write, mut value: u64) -> Result<u32, Error> {
    let mut count = 1;
    while (value & !0x7F) != 0 {
        write.write_all(&[((value & 0x7F) | 0x80) as u8])?;
        value >>= 7;
        count += 1;
    }
    write.write_all(&[(value as u8)])?;
    Result::Ok(count)
}

#[inline]
pub fn read_vint(read: &mut dyn Read) -> Result<u64, Error> {
    let mut buf = [1];
    read.read_exact(&mut buf)?;
    let mut res: u64 = u64::from(buf[0] & 0x7F);
    let mut shift = 7;
    while (buf[0] & 0x80) != 0 {
        read.read_exact(&mut buf)?;
        res |= u64::from(buf[0] & 0x7F) << shift;
        shift += 7
    }
    Ok(res)
}

/// 32-bit string hash used for facet ids and shard routing.
#[inline]
pub fn hash32(value: &str) -> u32 {
    xxh32(value.as_bytes(), HASH_SEED)
}

/// Maps a double onto 8 bytes whose lexicographic order equals numeric order.
/// Negative zero maps onto the key of zero.
pub fn f64_to_key(value: f64) -> [u8; 8] {
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    let ordered = if bits >> 63 == 1 {
        !bits
    } else {
        bits ^ (1 << 63)
    };
    ordered.to_be_bytes()
}

pub fn key_to_f64(key: [u8; 8]) -> f64 {
    let ordered = u64::from_be_bytes(key);
    let bits = if ordered >> 63 == 1 {
        ordered ^ (1 << 63)
    } else {
        !ordered
    };
    f64::from_bits(bits)
}

/// Formats a number the way number facets are keyed.
pub fn number_facet_string(value: f64) -> String {
    format!("{:.6}", value)
}

#[cfg(test)]
mod tests {

    use super::*;
    use proptest::prelude::*;
    use proptest::test_runner::Config;
    use std::io::Cursor;

    proptest! {
        #![proptest_config(Config::with_cases(10_000))]
        #[test]
        fn read_write_correct(num in any::<u64>()) {
            let mut write = Cursor::new(vec![0 as u8; 100]);
            write_vint(&mut write, num).unwrap();
            write.set_position(0);
            assert!(num == read_vint(&mut write).unwrap())
        }

        #[test]
        fn f64_keys_sort_like_numbers(a in -1e12f64..1e12, b in -1e12f64..1e12) {
            let (ka, kb) = (f64_to_key(a), f64_to_key(b));
            prop_assert_eq!(a.partial_cmp(&b).unwrap(), ka.cmp(&kb));
            prop_assert_eq!(key_to_f64(ka), a);
        }
    }

    #[test]
    fn negative_zero_is_zero() {
        assert!(f64_to_key(-1.0) < f64_to_key(-0.0));
        assert_eq!(f64_to_key(-0.0), f64_to_key(0.0));
        assert!(f64_to_key(f64::MIN) < f64_to_key(f64::MAX));
    }

    #[test]
    fn facet_strings_use_six_decimals() {
        assert_eq!("3.500000", number_facet_string(3.5));
        assert_eq!(hash32("red"), hash32("red"));
        assert!(hash32("red") != hash32("blue"));
    }
}
