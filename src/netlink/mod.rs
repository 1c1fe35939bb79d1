/*
Copyright 2024 The openBCE Authors.
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
    http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use futures::stream::TryStreamExt;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use rtnetlink::Handle;

use crate::apis::{FaasError, FaasResult};
use crate::cfg::Context;

pub type BinderPtr = Arc<dyn AddressBinder>;

/// Plumbs deployment addresses onto a host interface. Every address the
/// binder adds carries the project label, so teardown removes exactly its
/// own work and never an operator-added address.
#[async_trait::async_trait]
pub trait AddressBinder: Send + Sync + 'static {
    async fn add(&self, ip: Ipv4Addr) -> FaasResult<()>;
    async fn remove(&self, ip: Ipv4Addr) -> FaasResult<()>;
    /// Remove every address bearing the project label.
    async fn remove_labeled(&self) -> FaasResult<()>;
}

pub struct NetlinkBinder {
    interface: String,
    label: String,
    prefix_len: u8,
}

impl NetlinkBinder {
    pub fn new(cxt: &Context) -> Self {
        NetlinkBinder {
            interface: cxt.interface.clone(),
            label: cxt.label.clone(),
            prefix_len: cxt.prefix_len,
        }
    }

    async fn connect(&self) -> FaasResult<Handle> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| FaasError::Bind(format!("netlink connection: {e}")))?;
        tokio::spawn(connection);

        Ok(handle)
    }

    async fn link_index(&self, handle: &Handle) -> FaasResult<u32> {
        let mut links = handle
            .link()
            .get()
            .match_name(self.interface.clone())
            .execute();

        let link = links.try_next().await?.ok_or_else(|| {
            FaasError::Bind(format!("interface {} not found", self.interface))
        })?;

        Ok(link.header.index)
    }

    fn labeled(&self, msg: &AddressMessage) -> bool {
        msg.attributes
            .iter()
            .any(|a| matches!(a, AddressAttribute::Label(l) if *l == self.label))
    }

    fn carries(msg: &AddressMessage, ip: Ipv4Addr) -> bool {
        msg.attributes.iter().any(|a| {
            matches!(a,
                AddressAttribute::Address(IpAddr::V4(v4))
                | AddressAttribute::Local(IpAddr::V4(v4)) if *v4 == ip)
        })
    }
}

#[async_trait::async_trait]
impl AddressBinder for NetlinkBinder {
    async fn add(&self, ip: Ipv4Addr) -> FaasResult<()> {
        let handle = self.connect().await?;
        let index = self.link_index(&handle).await?;

        let mut request = handle
            .address()
            .add(index, IpAddr::V4(ip), self.prefix_len);
        request
            .message_mut()
            .attributes
            .push(AddressAttribute::Label(self.label.clone()));

        match request.execute().await {
            Ok(()) => {
                tracing::info!(
                    "Configured <{ip}/{}> on <{}> with label <{}>.",
                    self.prefix_len,
                    self.interface,
                    self.label
                );
                Ok(())
            }
            // The address surviving an earlier run is fine.
            Err(e) if e.to_string().contains("File exists") => {
                tracing::debug!("Address <{ip}> already configured on <{}>.", self.interface);
                Ok(())
            }
            Err(e) => Err(FaasError::Bind(format!("add {ip} to {}: {e}", self.interface))),
        }
    }

    async fn remove(&self, ip: Ipv4Addr) -> FaasResult<()> {
        let handle = self.connect().await?;

        let mut addresses = handle.address().get().execute();
        while let Some(msg) = addresses.try_next().await? {
            if self.labeled(&msg) && Self::carries(&msg, ip) {
                handle.address().del(msg).execute().await?;
                tracing::info!("Removed <{ip}> from <{}>.", self.interface);
            }
        }

        Ok(())
    }

    async fn remove_labeled(&self) -> FaasResult<()> {
        let handle = self.connect().await?;

        let mut addresses = handle.address().get().execute();
        while let Some(msg) = addresses.try_next().await? {
            if self.labeled(&msg) {
                handle.address().del(msg).execute().await?;
            }
        }
        tracing::info!("Removed all <{}>-labeled addresses.", self.label);

        Ok(())
    }
}
