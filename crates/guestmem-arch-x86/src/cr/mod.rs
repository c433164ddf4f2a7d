mod cr0;
mod cr3;
mod cr4;

pub use self::{cr0::Cr0, cr3::Cr3, cr4::Cr4};
