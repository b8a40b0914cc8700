//! Database identifier (spec §6): a 128-bit value rendered as a
//! 36-character `8-4-4-4-12` hex string.

use crate::status::Status;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatabaseId(pub u128);

impl fmt::Display for DatabaseId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let bytes = self.0.to_be_bytes();
		write!(
			f,
			"{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
			bytes[0],
			bytes[1],
			bytes[2],
			bytes[3],
			bytes[4],
			bytes[5],
			bytes[6],
			bytes[7],
			bytes[8],
			bytes[9],
			bytes[10],
			bytes[11],
			bytes[12],
			bytes[13],
			bytes[14],
			bytes[15],
		)
	}
}

impl FromStr for DatabaseId {
	type Err = Status;

	fn from_str(s: &str) -> Result<Self, Status> {
		if s.len() != 36 {
			return Err(Status::InvalidArg);
		}
		let groups: Vec<&str> = s.split('-').collect();
		if groups.len() != 5
			|| groups[0].len() != 8
			|| groups[1].len() != 4
			|| groups[2].len() != 4
			|| groups[3].len() != 4
			|| groups[4].len() != 12
		{
			return Err(Status::InvalidArg);
		}
		let hex: String = groups.concat();
		let mut bytes = [0u8; 16];
		for (i, byte) in bytes.iter_mut().enumerate() {
			*byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| Status::InvalidArg)?;
		}
		Ok(DatabaseId(u128::from_be_bytes(bytes)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips() {
		let id = DatabaseId(0x0123456789abcdef0123456789abcdef);
		let text = id.to_string();
		assert_eq!(text.len(), 36);
		let parsed: DatabaseId = text.parse().unwrap();
		assert_eq!(parsed, id);
	}

	#[test]
	fn rejects_wrong_length() {
		assert!("not-a-uuid".parse::<DatabaseId>().is_err());
	}
}
