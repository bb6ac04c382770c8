use std::env;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cloudflare::endpoints::dns::{
    CreateDnsRecord, CreateDnsRecordParams, DeleteDnsRecord, DnsContent, DnsRecord,
    ListDnsRecords, ListDnsRecordsParams, UpdateDnsRecord, UpdateDnsRecordParams,
};
use cloudflare::endpoints::zone::{ListZones, ListZonesParams, Zone};
use cloudflare::framework::async_api::{ApiClient, Client};
use cloudflare::framework::auth::Credentials;
use cloudflare::framework::response::ApiFailure;
use cloudflare::framework::{Environment, HttpApiClientConfig};
use futures_util::TryFutureExt;
use http::StatusCode;
use tap::TapFallible;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use crate::dns::provider::{ChangeBatch, DnsProvider, Record, RecordKind, Upsert};

const DEFAULT_TTL: Option<u32> = Some(120);
const PER_PAGE: u32 = 100;

/// Cloudflare backed [`DnsProvider`].
///
/// Alias records are plain CNAMEs, Cloudflare flattens them at the zone apex.
#[derive(Clone)]
pub struct CfDns {
    client: Arc<Client>,
}

impl Debug for CfDns {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CfDns")
            .field("client", &"Client".to_string())
            .finish()
    }
}

impl CfDns {
    pub fn new(credentials: Credentials) -> Result<Self> {
        let client = Client::new(
            credentials,
            HttpApiClientConfig::default(),
            Environment::Production,
        )?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    #[instrument(err, skip(self, upsert), fields(record = %upsert.record))]
    async fn upsert_record(&self, zone_id: &str, upsert: &Upsert) -> Result<()> {
        let record = &upsert.record;
        let content = record_content(record)?;

        let replaced_id = upsert
            .existing
            .as_ref()
            .and_then(|existing| existing.id.as_deref());

        match replaced_id {
            Some(id) => {
                let update_dns_req = UpdateDnsRecord {
                    zone_identifier: zone_id,
                    identifier: id,
                    params: UpdateDnsRecordParams {
                        ttl: DEFAULT_TTL,
                        proxied: None,
                        name: &record.name,
                        content,
                    },
                };

                let update_dns_resp = self
                    .client
                    .request(&update_dns_req)
                    .instrument(info_span!("update_dns_record"))
                    .await
                    .tap_err(|err| error!(%err, "update dns record failed"))?;

                if let Some(api_err) = update_dns_resp.errors.first() {
                    return Err(anyhow::anyhow!("{}", api_err));
                }

                info!(id, "update dns record success");
            }

            None => {
                let create_dns_req = CreateDnsRecord {
                    zone_identifier: zone_id,
                    params: CreateDnsRecordParams {
                        ttl: DEFAULT_TTL,
                        priority: None,
                        proxied: None,
                        name: &record.name,
                        content,
                    },
                };

                let create_dns_resp = self
                    .client
                    .request(&create_dns_req)
                    .instrument(info_span!("create_dns_record"))
                    .await
                    .tap_err(|err| error!(%err, "create dns record failed"))?;

                if let Some(api_err) = create_dns_resp.errors.first() {
                    return Err(anyhow::anyhow!("{}", api_err));
                }

                info!(id = %create_dns_resp.result.id, "create dns record success");
            }
        }

        Ok(())
    }

    #[instrument(err, skip(self, record), fields(record = %record))]
    async fn delete_record(&self, zone_id: &str, record: &Record) -> Result<()> {
        let id = record
            .id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("record {} has no id", record))?;

        let delete_dns_req = DeleteDnsRecord {
            zone_identifier: zone_id,
            identifier: id,
        };

        let delete_dns_resp = match self.client.request(&delete_dns_req).await {
            Err(ApiFailure::Error(status_code, _)) if status_code == StatusCode::NOT_FOUND => {
                info!(id, "dns record has been removed");

                return Ok(());
            }

            Err(err) => {
                error!(?delete_dns_req, %err, "delete dns failed");

                return Err(err.into());
            }

            Ok(resp) => resp,
        };

        if let Some(api_err) = delete_dns_resp.errors.first() {
            error!(%api_err, "delete dns failed with response");

            return Err(anyhow::anyhow!("{}", api_err));
        }

        info!(id, "delete dns record success");

        Ok(())
    }
}

#[async_trait]
impl DnsProvider for CfDns {
    #[instrument(err, skip(self))]
    async fn resolve_zone(&self, zone: &str) -> Result<String> {
        let list_zones_req = ListZones {
            params: ListZonesParams {
                name: Some(zone.to_string()),
                status: None,
                page: None,
                per_page: None,
                order: None,
                direction: None,
                search_match: None,
            },
        };

        let list_zones_resp = self.client.request(&list_zones_req).await.map_err(|err| {
            error!(%err, get_zone_request = ?list_zones_req, "send get zone id request failed");

            err
        })?;

        if let Some(api_err) = list_zones_resp.errors.first() {
            error!(%api_err, "list zone failed with response");

            return Err(anyhow::anyhow!("api error {}", api_err));
        }

        let zones: Vec<Zone> = list_zones_resp.result;

        zones
            .into_iter()
            .find_map(|zone_info| (zone_info.name == zone).then(|| zone_info.id))
            .ok_or_else(|| {
                error!(?zone, "zone is not exist");

                anyhow::anyhow!("zone {} is not exist", zone)
            })
    }

    #[instrument(err, skip(self))]
    async fn list_records(&self, zone_id: &str) -> Result<Vec<Record>> {
        let mut records = vec![];

        for page in 1.. {
            let list_dns_req = ListDnsRecords {
                zone_identifier: zone_id,
                params: ListDnsRecordsParams {
                    record_type: None,
                    name: None,
                    page: Some(page),
                    per_page: Some(PER_PAGE),
                    order: None,
                    direction: None,
                    search_match: None,
                },
            };

            let list_dns_resp = self
                .client
                .request(&list_dns_req)
                .inspect_err(|err| {
                    error!(?list_dns_req, %err, "list dns failed");
                })
                .await?;

            if let Some(api_err) = list_dns_resp.errors.first() {
                error!(%api_err, "list dns failed with response");

                return Err(anyhow::anyhow!("{}", api_err));
            }

            let dns_list: Vec<DnsRecord> = list_dns_resp.result;
            let last_page = dns_list.len() < PER_PAGE as usize;

            records.extend(dns_list.into_iter().map(to_record));

            if last_page {
                break;
            }
        }

        debug!(count = records.len(), "list dns records done");

        Ok(records)
    }

    #[instrument(err, skip(self, batch), fields(upserts = batch.upserts.len(), deletes = batch.deletes.len()))]
    async fn apply(&self, zone_id: &str, batch: &ChangeBatch) -> Result<()> {
        // no batch endpoint, the first failing change fails the whole apply. Deletes go
        // first so a name switching between alias and address records is free again.
        for record in &batch.deletes {
            self.delete_record(zone_id, record).await?;
        }

        for upsert in &batch.upserts {
            self.upsert_record(zone_id, upsert).await?;
        }

        info!("apply dns changes success");

        Ok(())
    }
}

fn record_content(record: &Record) -> Result<DnsContent> {
    match record.kind {
        RecordKind::CNAME => Ok(DnsContent::CNAME {
            content: record.target.clone(),
        }),

        RecordKind::A => Ok(DnsContent::A {
            content: record.target.parse()?,
        }),

        RecordKind::AAAA => Ok(DnsContent::AAAA {
            content: record.target.parse()?,
        }),

        RecordKind::Other => Err(anyhow::anyhow!("can't write record {}", record)),
    }
}

fn to_record(dns_record: DnsRecord) -> Record {
    let (kind, target) = match dns_record.content {
        DnsContent::A { content } => (RecordKind::A, content.to_string()),
        DnsContent::AAAA { content } => (RecordKind::AAAA, content.to_string()),
        DnsContent::CNAME { content } => (RecordKind::CNAME, content),

        _ => (RecordKind::Other, String::new()),
    };

    Record {
        id: Some(dns_record.id),
        name: dns_record.name,
        kind,
        target,
    }
}

/// Cloudflare credentials from `CF_DNS_EMAIL` + `CF_DNS_KEY`, or `CF_DNS_TOKEN`.
pub fn credentials_from_env() -> Option<Credentials> {
    create_credentials_from_email().or_else(create_credentials_from_token)
}

fn create_credentials_from_email() -> Option<Credentials> {
    let email = env::var("CF_DNS_EMAIL").ok()?;
    let key = env::var("CF_DNS_KEY").ok()?;

    Some(Credentials::UserAuthKey { email, key })
}

fn create_credentials_from_token() -> Option<Credentials> {
    let token = env::var("CF_DNS_TOKEN").ok()?;

    Some(Credentials::UserAuthToken { token })
}
