use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};

pub mod annotations;
pub mod operations;

pub trait GetApi {
    fn global_api<T: Resource<DynamicType = ()>>(&self) -> Api<T>;
    fn namespaced_api<T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>>(
        &self,
        namespace: &str,
    ) -> Api<T>;
}

impl GetApi for Client {
    fn global_api<T: Resource<DynamicType = ()>>(&self) -> Api<T> {
        Api::all(self.clone())
    }

    fn namespaced_api<T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>>(
        &self,
        namespace: &str,
    ) -> Api<T> {
        Api::namespaced(self.clone(), namespace)
    }
}

/// `namespace/name`, the key every namespaced object is tracked by.
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(namespace) => format!("{namespace}/{name}"),
        None => name.to_owned(),
    }
}
