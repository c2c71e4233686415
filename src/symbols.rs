//! Kernel symbol table management.
//!
//! Provides `symbol+offset` resolution for probe registration and address
//! symbolization for probe listings, on top of a kallsyms blob mapped by
//! `ksym`. Thumb functions keep bit 0 of their address.

use alloc::string::String;

use ksym::KallsymsMapped;
use spin::RwLock;

const KSYM_NAME_LEN: usize = 1024;

struct Table(KallsymsMapped<'static>);

// SAFETY: the mapped table only reads its `'static` blob after construction.
unsafe impl Send for Table {}
unsafe impl Sync for Table {}

static SYMBOL_TABLE: RwLock<Option<Table>> = RwLock::new(None);

/// Error types for symbol operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Symbol table has already been initialized.
    AlreadyInitialized,
    /// Failed to parse the symbol table blob or a location string.
    ParseError(&'static str),
    /// Symbol table has not been initialized yet.
    NotInitialized,
    /// No symbol with that name.
    NotFound,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyInitialized => write!(f, "Symbol table already initialized"),
            Self::ParseError(e) => write!(f, "Failed to parse symbol table: {}", e),
            Self::NotInitialized => write!(f, "Symbol table not initialized"),
            Self::NotFound => write!(f, "Symbol not found"),
        }
    }
}

impl core::error::Error for Error {}

/// Name and address lookups the location helpers are written against.
trait SymbolLookup {
    fn addr_of(&self, name: &str) -> Option<u64>;
    /// (name, size, offset, type) of the symbol covering `addr`.
    fn symbol_at(&self, addr: u64) -> Option<(String, u64, u64, char)>;
}

impl SymbolLookup for KallsymsMapped<'_> {
    fn addr_of(&self, name: &str) -> Option<u64> {
        self.lookup_name(name)
    }

    fn symbol_at(&self, addr: u64) -> Option<(String, u64, u64, char)> {
        let mut name_buf = [0u8; KSYM_NAME_LEN];
        self.lookup_address(addr, &mut name_buf)
            .map(|(name, size, offset, ty)| (String::from(name), size, offset, ty))
    }
}

/// Initialize the kernel symbol table from a kallsyms blob.
///
/// # Arguments
/// * `data` - The binary blob containing compressed symbol data
/// * `stext` - Start address of kernel text section
/// * `etext` - End address of kernel text section
///
/// A blob that fails to parse leaves the table uninitialized.
pub fn init(data: &'static [u8], stext: u64, etext: u64) -> Result<(), Error> {
    let mut table = SYMBOL_TABLE.write();
    if table.is_some() {
        return Err(Error::AlreadyInitialized);
    }
    let mapped = KallsymsMapped::from_blob(data, stext, etext).map_err(Error::ParseError)?;
    *table = Some(Table(mapped));
    Ok(())
}

/// Check if the symbol table has been initialized.
pub fn is_initialized() -> bool {
    SYMBOL_TABLE.read().is_some()
}

/// Lookup a symbol by address.
///
/// Returns (name, size, offset, type) if found.
pub fn lookup_symbol(addr: u32) -> Option<(String, u32, u32, char)> {
    let table = SYMBOL_TABLE.read();
    let (name, size, offset, ty) = table.as_ref()?.0.symbol_at(addr as u64)?;
    Some((name, size as u32, offset as u32, ty))
}

/// Lookup an address by symbol name.
pub fn lookup_addr(name: &str) -> Option<u32> {
    SYMBOL_TABLE.read().as_ref()?.0.addr_of(name).map(|a| a as u32)
}

/// Split `"name+0x10"` (or `"name+16"`, or `"name"`) into name and offset.
pub fn parse_location(location: &str) -> Result<(&str, u32), Error> {
    let (name, offset) = match location.split_once('+') {
        Some((name, off)) => {
            let off = off.trim();
            let value = match off.strip_prefix("0x") {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => off.parse::<u32>(),
            }
            .map_err(|_| Error::ParseError("invalid offset"))?;
            (name.trim(), value)
        }
        None => (location.trim(), 0),
    };
    if name.is_empty() {
        return Err(Error::ParseError("empty symbol name"));
    }
    Ok((name, offset))
}

fn resolve_in(table: &impl SymbolLookup, location: &str) -> Result<u32, Error> {
    let (name, offset) = parse_location(location)?;
    let base = table.addr_of(name).ok_or(Error::NotFound)? as u32;
    Ok(((base & !1).wrapping_add(offset)) | (base & 1))
}

fn describe_in(table: &impl SymbolLookup, addr: u32) -> Option<String> {
    let (name, _, off, _) = table.symbol_at(addr as u64)?;
    Some(if off == 0 {
        name
    } else {
        alloc::format!("{}+{:#x}", name, off)
    })
}

/// Resolve `"name+offset"` to an interworking address.
pub fn resolve(location: &str) -> Result<u32, Error> {
    parse_location(location)?;
    let table = SYMBOL_TABLE.read();
    let table = table.as_ref().ok_or(Error::NotInitialized)?;
    resolve_in(&table.0, location)
}

/// Format `addr` as `name+0xoff` when a symbol covers it.
pub fn describe(addr: u32) -> Option<String> {
    describe_in(&SYMBOL_TABLE.read().as_ref()?.0, addr)
}
