use std::{fmt, str::FromStr};

use log::warn;

use crate::{Error, ErrorKind};

/// Highest valid USB device address.
pub const MAX_ADDRESS: u8 = 127;

/// Set of USB device addresses the capture driver should record.
///
/// Sent to the driver with the StartFiltering request. The wire form is four
/// little-endian 32-bit words covering addresses 0..=127 followed by one byte
/// for the "capture everything" flag.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct AddressFilter {
    addresses: [u32; 4],
    filter_all: bool,
}

impl AddressFilter {
    /// Size of the packed structure sent to the driver.
    pub const WIRE_SIZE: usize = 17;

    /// Filter that captures every device, including ones connected later.
    pub fn all() -> Self {
        AddressFilter {
            addresses: [0; 4],
            filter_all: true,
        }
    }

    /// Filter that captures no device.
    pub fn none() -> Self {
        Self::default()
    }

    /// Parse a comma separated list of addresses, e.g. `"1,5,12"`.
    ///
    /// An empty list is valid. With `filter_all` the listed addresses are
    /// recorded but every device is captured anyway.
    pub fn parse(list: &str, filter_all: bool) -> Result<Self, Error> {
        let mut filter = AddressFilter {
            addresses: [0; 4],
            filter_all,
        };

        for item in list.split(',') {
            if item.is_empty() {
                continue;
            }
            if let Some(c) = item.chars().find(|c| !c.is_ascii_digit()) {
                warn!("Malformed address list. Invalid character: {c}.");
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "malformed address list",
                ));
            }
            let address = item
                .parse::<u32>()
                .ok()
                .filter(|&a| a <= u32::from(MAX_ADDRESS))
                .ok_or_else(|| {
                    warn!("Invalid address: {item}");
                    Error::new(ErrorKind::InvalidInput, "invalid USB address")
                })?;
            filter.set(address as u8)?;
        }

        Ok(filter)
    }

    fn range_and_index(address: u8) -> Option<(usize, u32)> {
        if address > MAX_ADDRESS {
            return None;
        }
        Some(((address / 32) as usize, u32::from(address % 32)))
    }

    /// Add `address` to the filter.
    pub fn set(&mut self, address: u8) -> Result<(), Error> {
        let (range, index) = Self::range_and_index(address)
            .ok_or(Error::new(ErrorKind::InvalidInput, "invalid USB address"))?;
        self.addresses[range] |= 1 << index;
        Ok(())
    }

    /// Whether traffic of `address` is captured.
    ///
    /// Addresses out of range are reported as captured.
    pub fn is_filtered(&self, address: u16) -> bool {
        if self.filter_all {
            return true;
        }
        let Some((range, index)) = u8::try_from(address).ok().and_then(Self::range_and_index)
        else {
            return true;
        };
        self.addresses[range] & (1 << index) != 0
    }

    pub fn filters_all(&self) -> bool {
        self.filter_all
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0; Self::WIRE_SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.addresses) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out[16] = self.filter_all as u8;
        out
    }
}

impl FromStr for AddressFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, false)
    }
}

impl fmt::Debug for AddressFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addresses: Vec<u8> = (0..=MAX_ADDRESS)
            .filter(|&a| {
                let (range, index) = (a as usize / 32, a % 32);
                self.addresses[range] & (1 << index) != 0
            })
            .collect();
        f.debug_struct("AddressFilter")
            .field("addresses", &addresses)
            .field("filter_all", &self.filter_all)
            .finish()
    }
}

#[test]
fn test_parse_address_list() {
    let f: AddressFilter = "1,5,127".parse().unwrap();
    assert!(f.is_filtered(1));
    assert!(f.is_filtered(5));
    assert!(f.is_filtered(127));
    assert!(!f.is_filtered(2));
    assert!(!f.filters_all());

    // trailing and doubled separators are tolerated
    let f: AddressFilter = "3,,4,".parse().unwrap();
    assert!(f.is_filtered(3) && f.is_filtered(4));

    assert_eq!("".parse::<AddressFilter>().unwrap(), AddressFilter::none());

    assert_eq!(
        "1, 2".parse::<AddressFilter>().unwrap_err().kind(),
        ErrorKind::InvalidInput
    );
    assert_eq!(
        "128".parse::<AddressFilter>().unwrap_err().kind(),
        ErrorKind::InvalidInput
    );
    assert!("99999999999999".parse::<AddressFilter>().is_err());
}

#[test]
fn test_filter_all() {
    let f = AddressFilter::all();
    assert!(f.is_filtered(0));
    assert!(f.is_filtered(64));

    let f = AddressFilter::none();
    assert!(!f.is_filtered(64));
    // out of range addresses count as filtered
    assert!(f.is_filtered(300));
}

#[test]
fn test_wire_form() {
    let mut f = AddressFilter::none();
    f.set(0).unwrap();
    f.set(33).unwrap();
    f.set(127).unwrap();
    assert!(f.set(128).is_err());

    let bytes = f.to_bytes();
    assert_eq!(&bytes[0..4], &[0x01, 0, 0, 0]);
    assert_eq!(&bytes[4..8], &[0x02, 0, 0, 0]);
    assert_eq!(&bytes[8..12], &[0, 0, 0, 0]);
    assert_eq!(&bytes[12..16], &[0, 0, 0, 0x80]);
    assert_eq!(bytes[16], 0);

    assert_eq!(AddressFilter::all().to_bytes()[16], 1);
}
