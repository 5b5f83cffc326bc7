//! Target address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Address inside the target process
///
/// Wraps a `u64` so addresses cannot be confused with sizes, slot indices or
/// raw register values. Breakpoint tables are keyed by this type, which is
/// why it is `Ord` and `Hash`.
///
/// ## Example
///
/// ```rust
/// use kestrel_core::types::Address;
///
/// let addr = Address::from(0x1234);
/// assert_eq!(addr.align_down(0x1000), Address::from(0x1000));
/// assert_eq!((addr + 0x10).value(), 0x1244);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    pub const ZERO: Self = Address(0);

    /// Create an address in const contexts.
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Raw value, for handing to native APIs and debug registers.
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Add an offset, returning `None` on overflow.
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Round down to the start of the page containing this address.
    ///
    /// `page_size` must be a power of two (every supported platform reports
    /// one); a zero page size returns the address unchanged.
    pub fn align_down(self, page_size: u64) -> Self
    {
        if page_size == 0 {
            return self;
        }
        Address(self.0 & !(page_size - 1))
    }

    /// Whether this address lies in `[start, start + len)`.
    pub fn is_within(self, start: Address, len: u64) -> bool
    {
        self >= start && self.0 - start.0 < len
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}
