//! Byte order of a file relative to the host.

use serde::Serialize;

/// Byte order declared by a file's magic string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Byte order of the running process, read off a native-endian value.
    pub fn host() -> Self {
        if u16::from_ne_bytes([1, 0]) == 1 {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }

    pub fn is_host(self) -> bool {
        self == Self::host()
    }

    pub fn name(self) -> &'static str {
        match self {
            Endianness::Little => "little",
            Endianness::Big    => "big",
        }
    }
}

/// Requested byte order for newly written files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Native,
    Little,
    Big,
}

impl ByteOrder {
    pub fn resolve(self) -> Endianness {
        match self {
            ByteOrder::Native => Endianness::host(),
            ByteOrder::Little => Endianness::Little,
            ByteOrder::Big    => Endianness::Big,
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "native"        => Some(ByteOrder::Native),
            "little" | "le" => Some(ByteOrder::Little),
            "big" | "be"    => Some(ByteOrder::Big),
            _               => None,
        }
    }
}

/// Reverse the bytes of every `elem_size`-wide element of `data` in place.
///
/// Sizes of 0 and 1 are no-ops; a trailing partial element is left untouched.
pub fn swap_elements(data: &mut [u8], elem_size: usize) {
    if elem_size < 2 {
        return;
    }
    for elem in data.chunks_exact_mut(elem_size) {
        elem.reverse();
    }
}
