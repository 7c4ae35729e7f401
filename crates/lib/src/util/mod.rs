//! Shared utilities.
//!
//! Hashing, random identifiers, human readable sizes and test helpers.

pub mod hash;

#[cfg(test)]
pub mod testutil;

/// Formats a byte count with binary units, e.g. `40.0 MiB`.
pub fn format_bytes(bytes: u64) -> String {
  const KIB: u64 = 1024;
  const MIB: u64 = KIB * 1024;
  const GIB: u64 = MIB * 1024;

  if bytes >= GIB {
    format!("{:.1} GiB", bytes as f64 / GIB as f64)
  } else if bytes >= MIB {
    format!("{:.1} MiB", bytes as f64 / MIB as f64)
  } else if bytes >= KIB {
    format!("{:.1} KiB", bytes as f64 / KIB as f64)
  } else {
    format!("{} B", bytes)
  }
}

const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Random alphanumeric identifier of `len` characters.
pub fn random_base62(len: usize) -> Result<String, getrandom::Error> {
  let mut id = String::with_capacity(len);
  let mut buf = [0u8; 32];

  while id.len() < len {
    getrandom::fill(&mut buf)?;
    // Rejecting bytes >= 248 keeps the distribution uniform.
    for b in buf.iter().filter(|b| **b < 248) {
      if id.len() == len {
        break;
      }
      id.push(BASE62[(*b % 62) as usize] as char);
    }
  }

  Ok(id)
}
