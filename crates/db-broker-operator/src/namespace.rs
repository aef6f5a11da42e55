//! Which namespaces the controllers watch.

use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Resource};

use crate::client::Client;

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum WatchNamespace {
    All,
    One(String),
}

impl From<&str> for WatchNamespace {
    fn from(s: &str) -> Self {
        match s.trim() {
            "" => WatchNamespace::All,
            namespace => WatchNamespace::One(namespace.to_owned()),
        }
    }
}

impl WatchNamespace {
    /// An API scoped to the watched namespace, or cluster-wide when watching all of them.
    pub fn get_api<T>(&self, client: &Client) -> Api<T>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match self {
            WatchNamespace::All => client.get_all_api(),
            WatchNamespace::One(namespace) => client.get_api::<T>(namespace),
        }
    }
}
