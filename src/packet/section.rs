//! DNS message sections.
//!
//! Messages order their entries as *Question*, *Answer*, *Authority*,
//! *Additional Records*. The decoder and encoder use these marker types to
//! track the section they are positioned at in the type system.

mod sealed {
    pub trait Sealed {}
}

pub trait Section: sealed::Sealed + 'static {}

pub enum Question {}
pub enum Answer {}
pub enum Authority {}
pub enum Additional {}

impl sealed::Sealed for Question {}
impl sealed::Sealed for Answer {}
impl sealed::Sealed for Authority {}
impl sealed::Sealed for Additional {}
impl Section for Question {}
impl Section for Answer {}
impl Section for Authority {}
impl Section for Additional {}
