// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A registry of UUID kinds used in the control plane.
//!
//! Hosts, clusters, VMs and offerings are all identified by UUIDs. If they
//! were all the same type it would be easy to pass a host ID where a cluster
//! ID is expected; each kind here gets its own [`TypedUuid`] alias instead.

pub use newtype_uuid::{GenericUuid, TypedUuid, TypedUuidKind, TypedUuidTag};

macro_rules! impl_typed_uuid_kind {
    ($($kind:ident => $tag:literal),* $(,)?) => {
        $(
            #[derive(Debug, PartialEq, Eq)]
            pub enum $kind {}

            impl TypedUuidKind for $kind {
                #[inline]
                fn tag() -> TypedUuidTag {
                    // `const` forces the tag to be validated at compile time.
                    const TAG: TypedUuidTag = TypedUuidTag::new($tag);
                    TAG
                }
            }
        )*
    };
}

impl_typed_uuid_kind! {
    ClusterKind => "cluster",
    HostKind => "host",
    PodKind => "pod",
    ServiceOfferingKind => "service_offering",
    VmKind => "vm",
    ZoneKind => "zone",
}

pub type ClusterUuid = TypedUuid<ClusterKind>;
pub type HostUuid = TypedUuid<HostKind>;
pub type PodUuid = TypedUuid<PodKind>;
pub type ServiceOfferingUuid = TypedUuid<ServiceOfferingKind>;
pub type VmUuid = TypedUuid<VmKind>;
pub type ZoneUuid = TypedUuid<ZoneKind>;
