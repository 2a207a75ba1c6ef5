//! In-memory backend. Enforces the same name/email uniqueness as the durable
//! backends so that engine-level behavior is identical across targets.
//! `iterate` walks a snapshot taken at call time.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;

use crate::backend::BackendConnection;
use crate::misc::AccountError;
use crate::user_record::{RecordFilter, RecordUpdate, UserRecord};

#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, UserRecord>>,
}

#[async_trait]
impl BackendConnection for MemoryBackend {
    async fn connect(&mut self) -> Result<(), AccountError> {
        Ok(())
    }

    async fn is_connected(&self) -> Result<bool, AccountError> {
        Ok(true)
    }

    async fn exists(&self, any_of: &[RecordFilter]) -> Result<bool, AccountError> {
        let read = self.records.read();
        Ok(read
            .values()
            .any(|record| any_of.iter().any(|f| record.matches(f))))
    }

    async fn get(&self, all_of: &[RecordFilter]) -> Result<Option<UserRecord>, AccountError> {
        let read = self.records.read();
        Ok(read
            .values()
            .find(|record| record.matches_all(all_of))
            .cloned())
    }

    #[allow(unused_results)]
    async fn insert(&self, record: &UserRecord) -> Result<(), AccountError> {
        let mut write = self.records.write();

        let conflict = write.values().any(|existing| {
            existing.user_id == record.user_id
                || (record.name.is_some() && existing.name == record.name)
                || (record.email.is_some() && existing.email == record.email)
        });

        if conflict {
            return Err(AccountError::DetailsExist);
        }

        write.insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn update(
        &self,
        all_of: &[RecordFilter],
        changes: &[RecordUpdate],
    ) -> Result<u64, AccountError> {
        let mut write = self.records.write();

        // reject updates that would collide with another record's unique fields
        for change in changes {
            let taken = match change {
                RecordUpdate::Name(name) => write
                    .values()
                    .any(|r| r.name.as_deref() == Some(name.as_str()) && !r.matches_all(all_of)),
                RecordUpdate::Email(email) => write
                    .values()
                    .any(|r| r.email.as_deref() == Some(email.as_str()) && !r.matches_all(all_of)),
                _ => false,
            };

            if taken {
                return Err(AccountError::DetailsExist);
            }
        }

        let mut matched = 0;
        for record in write.values_mut() {
            if record.matches_all(all_of) {
                matched += 1;
                for change in changes {
                    change.apply(record);
                }
            }
        }

        Ok(matched)
    }

    async fn delete(&self, all_of: &[RecordFilter]) -> Result<u64, AccountError> {
        let mut write = self.records.write();
        let before = write.len();
        write.retain(|_, record| !record.matches_all(all_of));
        Ok((before - write.len()) as u64)
    }

    async fn iterate(
        &self,
        all_of: &[RecordFilter],
    ) -> Result<BoxStream<'static, Result<UserRecord, AccountError>>, AccountError> {
        let snapshot: Vec<UserRecord> = {
            let read = self.records.read();
            read.values()
                .filter(|record| record.matches_all(all_of))
                .cloned()
                .collect()
        };

        Ok(futures::stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn purge(&self) -> Result<usize, AccountError> {
        let mut write = self.records.write();
        let len = write.len();
        write.clear();
        Ok(len)
    }
}
