//! Caller-owned variables handed to a single read or write call.
//!
//! A [`Variable`] borrows the caller's buffer for the duration of one call
//! and describes its schema: element size, float-ness, signedness and the
//! coordinate / ghost flags stored in the file's variable table.

use bytemuck::Pod;
use serde::Serialize;

use crate::crc64::CRC_SIZE;
use crate::layout::{
    VariableHeader, VAR_FLAG_FLOAT, VAR_FLAG_MAYBE_GHOST, VAR_FLAG_PHYS_X, VAR_FLAG_PHYS_Y,
    VAR_FLAG_PHYS_Z, VAR_FLAG_SIGNED,
};

// ── Element types ────────────────────────────────────────────────────────────

/// A primitive that can be stored in a variable.
pub trait Element: Pod {
    const IS_FLOAT:  bool;
    const IS_SIGNED: bool;
}

macro_rules! element {
    ($($t:ty => $float:expr, $signed:expr;)*) => {
        $(impl Element for $t {
            const IS_FLOAT:  bool = $float;
            const IS_SIGNED: bool = $signed;
        })*
    };
}

element! {
    i8  => false, true;
    i16 => false, true;
    i32 => false, true;
    i64 => false, true;
    u8  => false, false;
    u16 => false, false;
    u32 => false, false;
    u64 => false, false;
    f32 => true,  true;
    f64 => true,  true;
}

// ── VariableInfo ─────────────────────────────────────────────────────────────

/// Schema of one variable, as stored in the variable table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableInfo {
    pub name:         String,
    pub size:         usize,
    pub is_float:     bool,
    pub is_signed:    bool,
    pub phys_coord_x: bool,
    pub phys_coord_y: bool,
    pub phys_coord_z: bool,
    pub maybe_ghost:  bool,
}

impl VariableInfo {
    pub fn of<T: Element>(name: impl Into<String>) -> Self {
        Self {
            name:         name.into(),
            size:         std::mem::size_of::<T>(),
            is_float:     T::IS_FLOAT,
            is_signed:    T::IS_SIGNED,
            phys_coord_x: false,
            phys_coord_y: false,
            phys_coord_z: false,
            maybe_ghost:  false,
        }
    }

    pub(crate) fn from_header(h: &VariableHeader) -> Self {
        Self {
            name:         h.name.clone(),
            size:         h.size as usize,
            is_float:     h.flags & VAR_FLAG_FLOAT != 0,
            is_signed:    h.flags & VAR_FLAG_SIGNED != 0,
            phys_coord_x: h.flags & VAR_FLAG_PHYS_X != 0,
            phys_coord_y: h.flags & VAR_FLAG_PHYS_Y != 0,
            phys_coord_z: h.flags & VAR_FLAG_PHYS_Z != 0,
            maybe_ghost:  h.flags & VAR_FLAG_MAYBE_GHOST != 0,
        }
    }

    pub(crate) fn flags(&self) -> u64 {
        let mut flags = 0;
        if self.is_float     { flags |= VAR_FLAG_FLOAT; }
        if self.is_signed    { flags |= VAR_FLAG_SIGNED; }
        if self.phys_coord_x { flags |= VAR_FLAG_PHYS_X; }
        if self.phys_coord_y { flags |= VAR_FLAG_PHYS_Y; }
        if self.phys_coord_z { flags |= VAR_FLAG_PHYS_Z; }
        if self.maybe_ghost  { flags |= VAR_FLAG_MAYBE_GHOST; }
        flags
    }

    pub(crate) fn to_header(&self) -> VariableHeader {
        VariableHeader { name: self.name.clone(), flags: self.flags(), size: self.size as u64 }
    }

    /// Human-readable type name, e.g. `f32` or `i64`.
    pub fn type_name(&self) -> String {
        let kind = if self.is_float { 'f' } else if self.is_signed { 'i' } else { 'u' };
        format!("{kind}{}", self.size * 8)
    }
}

// ── Variable ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum VarData<'a> {
    Shared(&'a [u8]),
    Exclusive(&'a mut [u8]),
}

/// A named buffer of elements plus its schema.
///
/// `with_extra_space` declares that the last [`CRC_SIZE`] bytes of the buffer
/// are scratch space for the CRC trailer, which lets payload and trailer move
/// in a single I/O call.  Writes restore those bytes afterwards.
#[derive(Debug)]
pub struct Variable<'a> {
    info:            VariableInfo,
    has_extra_space: bool,
    data:            VarData<'a>,
}

impl<'a> Variable<'a> {
    /// A write-only variable over `data`.
    pub fn new<T: Element>(name: impl Into<String>, data: &'a [T]) -> Self {
        Self {
            info:            VariableInfo::of::<T>(name),
            has_extra_space: false,
            data:            VarData::Shared(bytemuck::cast_slice(data)),
        }
    }

    /// A variable that can be read into or written from.
    pub fn new_mut<T: Element>(name: impl Into<String>, data: &'a mut [T]) -> Self {
        Self {
            info:            VariableInfo::of::<T>(name),
            has_extra_space: false,
            data:            VarData::Exclusive(bytemuck::cast_slice_mut(data)),
        }
    }

    /// An untyped variable; `info.size` gives the element width.
    pub fn from_bytes(info: VariableInfo, data: &'a mut [u8]) -> Self {
        Self { info, has_extra_space: false, data: VarData::Exclusive(data) }
    }

    pub fn phys_coord_x(mut self) -> Self { self.info.phys_coord_x = true; self }
    pub fn phys_coord_y(mut self) -> Self { self.info.phys_coord_y = true; self }
    pub fn phys_coord_z(mut self) -> Self { self.info.phys_coord_z = true; self }
    pub fn maybe_ghost(mut self) -> Self  { self.info.maybe_ghost = true; self }

    pub fn with_extra_space(mut self) -> Self {
        self.has_extra_space = true;
        self
    }

    pub fn info(&self) -> &VariableInfo { &self.info }
    pub fn name(&self) -> &str { &self.info.name }
    pub fn elem_size(&self) -> usize { self.info.size }
    pub fn has_extra_space(&self) -> bool { self.has_extra_space }

    fn extra(&self) -> usize {
        if self.has_extra_space { CRC_SIZE } else { 0 }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        match &self.data {
            VarData::Shared(b)    => b,
            VarData::Exclusive(b) => b,
        }
    }

    pub(crate) fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.data {
            VarData::Shared(_)    => None,
            VarData::Exclusive(b) => Some(b),
        }
    }

    /// Buffer bytes available for elements, excluding the extra space.
    pub fn payload_capacity(&self) -> usize {
        self.bytes().len().saturating_sub(self.extra())
    }

    /// Whole elements the buffer holds, excluding the extra space.
    pub fn num_elems(&self) -> usize {
        if self.info.size == 0 { 0 } else { self.payload_capacity() / self.info.size }
    }
}
