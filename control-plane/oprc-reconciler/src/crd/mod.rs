pub mod app_stack;

pub use app_stack::{
    AppStack, AppStackSpec, AppStackStatus, IngressSpec, ResourceRef, TlsSpec,
};
