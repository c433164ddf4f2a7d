mod access_context;
mod info;
pub(crate) mod macros;
mod vcpu_id;

pub use self::{
    access_context::{AccessContext, Gfn, Pa, TranslationMechanism, Va},
    info::DomainInfo,
    vcpu_id::VcpuId,
};
