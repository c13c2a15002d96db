// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodically rebuilds every host's capacity ledger from its VMs.
//!
//! Lifecycle transitions adjust the ledger incrementally, after the
//! transition itself has been persisted. A crash or a lost lock between the
//! two leaves the ledger wrong until something recomputes it. This task
//! does that: for each known host it calls
//! [`CapacityManager::update_capacity_for_host`], which also drops
//! reservations held for VMs that have been stopped for longer than the
//! configured amnesty and announces each one on the event bus.

use crate::app::background::BackgroundTask;
use crate::app::capacity::CapacityManager;
use anyhow::Context;
use cirrus_db_queries::context::OpContext;
use cirrus_db_queries::db::DataStore;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

/// Background task that recomputes host capacity from ground truth
pub struct HostCapacityReconciler {
    datastore: Arc<DataStore>,
    capacity: Arc<CapacityManager>,
}

#[derive(Debug, Default)]
struct ActivationResults {
    hosts_checked: usize,
    hosts_updated: usize,
    reservations_freed: usize,
    errors: Vec<String>,
}

impl HostCapacityReconciler {
    pub fn new(
        datastore: Arc<DataStore>,
        capacity: Arc<CapacityManager>,
    ) -> Self {
        Self { datastore, capacity }
    }

    async fn reconcile_all(
        &mut self,
        opctx: &OpContext,
        results: &mut ActivationResults,
    ) -> Result<(), anyhow::Error> {
        let hosts = self
            .datastore
            .host_list()
            .await
            .context("failed to list hosts")?;

        for host in hosts {
            results.hosts_checked += 1;
            let outcome = self
                .capacity
                .update_capacity_for_host(opctx, host.id)
                .await
                .with_context(|| {
                    format!("failed to reconcile capacity of host {}", host.id)
                });
            match outcome {
                Ok(outcome) => {
                    if outcome.changed {
                        results.hosts_updated += 1;
                    }
                    results.reservations_freed += outcome.reservations_freed;
                }
                Err(error) => {
                    // One bad host doesn't stop the rest.
                    warn!(
                        opctx.log,
                        "host capacity reconciliation failed";
                        "host_id" => %host.id,
                        "error" => format!("{error:#}"),
                    );
                    results.errors.push(format!("{error:#}"));
                }
            }
        }
        Ok(())
    }
}

impl BackgroundTask for HostCapacityReconciler {
    fn activate<'a>(
        &'a mut self,
        opctx: &'a OpContext,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            let mut results = ActivationResults::default();
            match self.reconcile_all(opctx, &mut results).await {
                Ok(()) => {
                    info!(
                        opctx.log,
                        "host capacity reconciled";
                        "hosts_checked" => results.hosts_checked,
                        "hosts_updated" => results.hosts_updated,
                        "reservations_freed" => results.reservations_freed,
                        "errors" => results.errors.len(),
                    );
                }
                Err(error) => {
                    error!(
                        opctx.log,
                        "host capacity reconciler activation failed";
                        "error" => format!("{error:#}"),
                    );
                    results.errors.push(format!("{error:#}"));
                }
            }
            serde_json::json!({
                "hosts_checked": results.hosts_checked,
                "hosts_updated": results.hosts_updated,
                "reservations_freed": results.reservations_freed,
                "errors": results.errors,
            })
        }
        .boxed()
    }
}
