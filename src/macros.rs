//! # Internal Macros
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! little-endian wrapper types. Used by the on-disk dual-buffer slot header.
//!
//! ```ignore
//! use zerocopy::little_endian::U64;
//!
//! #[repr(C)]
//! struct SlotHeader {
//!     transaction_id: U64,
//! }
//!
//! impl SlotHeader {
//!     zerocopy_accessors! {
//!         transaction_id: u64,
//!     }
//! }
//!
//! // Generates:
//! // pub fn transaction_id(&self) -> u64 { self.transaction_id.get() }
//! // pub fn set_transaction_id(&mut self, val: u64) { self.transaction_id = U64::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
