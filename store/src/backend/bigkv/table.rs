//! The wide-column table client seam.
//!
//! The driver reads and mutates rows through [`WideColumnTable`]; cloud
//! client construction is an external concern. The production binding over
//! `bigtable_rs` lives behind the `bigtable` feature; tests drive the seam
//! with an in-process fake.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::model::{Kv, Limit};

/// A half-open physical row-key range; `exclusive_end = None` is unbounded.
#[derive(Debug, Clone)]
pub struct RowRange {
    pub start: Bytes,
    pub exclusive_end: Option<Bytes>,
}

/// The rows addressed by one native read request.
#[derive(Debug, Clone)]
pub enum RowSet {
    /// Explicit row keys. The engine returns present rows in key order.
    Keys(Vec<Bytes>),
    /// A list of ranges, served by a single native request; results arrive
    /// in table order.
    Ranges(Vec<RowRange>),
}

/// One entry of a bulk mutation.
#[derive(Debug, Clone)]
pub enum RowMutation {
    Set { key: Bytes, value: Bytes },
    DeleteRow { key: Bytes },
}

impl RowMutation {
    pub fn size(&self) -> usize {
        match self {
            RowMutation::Set { key, value } => key.len() + value.len(),
            RowMutation::DeleteRow { key } => key.len(),
        }
    }
}

/// The subset of a wide-column table client the driver relies on.
///
/// Values live in a single column family; reads are always restricted to
/// the latest cell. `strip_values` corresponds to a strip-value transformer
/// chained before the latest-cell filter, for key-only reads.
#[async_trait]
pub trait WideColumnTable: Send + Sync + 'static {
    /// Reads the latest cell of one row.
    async fn read_row(&self, key: Bytes) -> Result<Option<Bytes>>;

    /// Reads the latest cell of every addressed row, up to `limit` rows.
    async fn read_rows(&self, set: RowSet, limit: Limit, strip_values: bool) -> Result<Vec<Kv>>;

    /// Applies a bulk mutation. Per-row failures combine into one error.
    async fn apply_bulk(&self, mutations: Vec<RowMutation>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[cfg(feature = "bigtable")]
pub use production::BigtableTable;

#[cfg(feature = "bigtable")]
mod production {
    use super::*;
    use crate::error::Error;

    use bigtable_rs::bigtable::{BigTable, BigTableConnection};
    use bigtable_rs::google::bigtable::v2::{
        mutate_rows_request, mutation, row_filter, row_range, MutateRowsRequest, Mutation,
        ReadRowsRequest, RowFilter, RowRange as PbRowRange, RowSet as PbRowSet,
    };

    /// Production binding over the cloud wide-column client.
    pub struct BigtableTable {
        client: BigTable,
        table_name: String,
        family: String,
        qualifier: Vec<u8>,
    }

    impl BigtableTable {
        pub async fn connect(
            project: &str,
            instance: &str,
            table: &str,
            family: &str,
            qualifier: &str,
        ) -> Result<Self> {
            let connection = BigTableConnection::new(project, instance, false, 4, None)
                .await
                .map_err(Error::storage)?;
            let client = connection.client();
            let table_name = client.get_full_table_name(table);
            Ok(Self {
                client,
                table_name,
                family: family.to_string(),
                qualifier: qualifier.as_bytes().to_vec(),
            })
        }

        /// The strip-value transformer goes before the latest-cell filter so
        /// the engine drops payloads before version trimming.
        fn filter(strip_values: bool) -> RowFilter {
            let latest = RowFilter {
                filter: Some(row_filter::Filter::CellsPerColumnLimitFilter(1)),
            };
            if !strip_values {
                return latest;
            }
            RowFilter {
                filter: Some(row_filter::Filter::Chain(row_filter::Chain {
                    filters: vec![
                        RowFilter {
                            filter: Some(row_filter::Filter::StripValueTransformer(true)),
                        },
                        latest,
                    ],
                })),
            }
        }

        fn to_pb_rows(set: RowSet) -> PbRowSet {
            match set {
                RowSet::Keys(keys) => PbRowSet {
                    row_keys: keys.into_iter().map(|k| k.to_vec()).collect(),
                    row_ranges: vec![],
                },
                RowSet::Ranges(ranges) => PbRowSet {
                    row_keys: vec![],
                    row_ranges: ranges
                        .into_iter()
                        .map(|r| PbRowRange {
                            start_key: Some(row_range::StartKey::StartKeyClosed(r.start.to_vec())),
                            end_key: r
                                .exclusive_end
                                .map(|e| row_range::EndKey::EndKeyOpen(e.to_vec())),
                        })
                        .collect(),
                },
            }
        }
    }

    #[async_trait]
    impl WideColumnTable for BigtableTable {
        async fn read_row(&self, key: Bytes) -> Result<Option<Bytes>> {
            let rows = self
                .read_rows(RowSet::Keys(vec![key]), Limit(1), false)
                .await?;
            Ok(rows.into_iter().next().map(|kv| kv.value))
        }

        async fn read_rows(
            &self,
            set: RowSet,
            limit: Limit,
            strip_values: bool,
        ) -> Result<Vec<Kv>> {
            let request = ReadRowsRequest {
                table_name: self.table_name.clone(),
                rows: Some(Self::to_pb_rows(set)),
                filter: Some(Self::filter(strip_values)),
                rows_limit: limit.0 as i64,
                ..ReadRowsRequest::default()
            };

            let rows = self
                .client
                .clone()
                .read_rows(request)
                .await
                .map_err(Error::storage)?;

            Ok(rows
                .into_iter()
                .map(|(key, cells)| {
                    let value = cells
                        .into_iter()
                        .next()
                        .map(|c| Bytes::from(c.value))
                        .unwrap_or_default();
                    Kv::new(key, value)
                })
                .collect())
        }

        async fn apply_bulk(&self, mutations: Vec<RowMutation>) -> Result<()> {
            let entries = mutations
                .into_iter()
                .map(|m| match m {
                    RowMutation::Set { key, value } => mutate_rows_request::Entry {
                        row_key: key.to_vec(),
                        mutations: vec![Mutation {
                            mutation: Some(mutation::Mutation::SetCell(mutation::SetCell {
                                family_name: self.family.clone(),
                                column_qualifier: self.qualifier.clone(),
                                timestamp_micros: -1,
                                value: value.to_vec(),
                            })),
                        }],
                    },
                    RowMutation::DeleteRow { key } => mutate_rows_request::Entry {
                        row_key: key.to_vec(),
                        mutations: vec![Mutation {
                            mutation: Some(mutation::Mutation::DeleteFromRow(
                                mutation::DeleteFromRow {},
                            )),
                        }],
                    },
                })
                .collect();

            let request = MutateRowsRequest {
                table_name: self.table_name.clone(),
                entries,
                ..MutateRowsRequest::default()
            };

            let responses = self
                .client
                .clone()
                .mutate_rows(request)
                .await
                .map_err(Error::storage)?;

            let failures: Vec<String> = responses
                .into_iter()
                .filter_map(|entry| {
                    entry.status.and_then(|status| {
                        if status.code == 0 {
                            None
                        } else {
                            Some(format!("row {}: {}", entry.index, status.message))
                        }
                    })
                })
                .collect();
            if !failures.is_empty() {
                return Err(Error::Storage(format!(
                    "apply bulk error: {}",
                    failures.join("; ")
                )));
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }
}
