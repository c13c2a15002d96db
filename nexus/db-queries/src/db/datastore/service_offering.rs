// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`ServiceOffering`]s.

use super::DataStore;
use cirrus_common::api::external::{
    CreateResult, Error, LookupResult, ResourceType,
};
use cirrus_db_model::ServiceOffering;
use cirrus_uuid_kinds::{GenericUuid, ServiceOfferingUuid};

impl DataStore {
    pub async fn service_offering_create(
        &self,
        offering: ServiceOffering,
    ) -> CreateResult<ServiceOffering> {
        let mut tables = self.tables();
        if tables.service_offerings.contains_key(&offering.id) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::ServiceOffering,
                object_name: offering.name.clone(),
            });
        }
        debug!(
            self.log,
            "created service offering";
            "offering_id" => %offering.id,
            "name" => &offering.name,
        );
        tables.service_offerings.insert(offering.id, offering.clone());
        Ok(offering)
    }

    pub async fn service_offering_fetch(
        &self,
        offering_id: ServiceOfferingUuid,
    ) -> LookupResult<ServiceOffering> {
        self.tables().service_offerings.get(&offering_id).cloned().ok_or_else(
            || {
                Error::not_found_by_id(
                    ResourceType::ServiceOffering,
                    offering_id.as_untyped_uuid(),
                )
            },
        )
    }
}
