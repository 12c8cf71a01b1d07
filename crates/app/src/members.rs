use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use clubhub_core::member::{Member, MemberCreateCommand, MemberStatus};
use clubhub_storage::{Database, MemberRepository, MemberStoreError, NewMember};

/// Shared clock used so tests can pin timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Read-side facade over the member store.
#[derive(Clone)]
pub struct MemberFinder {
    members: MemberRepository,
}

impl MemberFinder {
    pub fn new(database: &Database) -> Self {
        Self {
            members: database.members(),
        }
    }

    /// Loads a member by id, failing when no such member exists.
    pub async fn fetch_member_by_id(&self, id: &str) -> Result<Member, MemberError> {
        self.members
            .fetch_by_id(id)
            .await?
            .ok_or(MemberError::NotFound)
    }

    /// Returns the subset of `student_ids` already registered by active members.
    pub async fn filter_existing_student_ids(
        &self,
        student_ids: &[String],
    ) -> Result<Vec<String>, MemberError> {
        Ok(self.members.find_existing_student_ids(student_ids).await?)
    }

    /// Resolves the requested ids within a batch, keyed by member id.
    ///
    /// Fails when any requested id is missing from the result set.
    pub async fn fetch_members_by_ids_and_batch(
        &self,
        ids: &[String],
        batch: &str,
    ) -> Result<HashMap<String, Member>, MemberError> {
        let members = self.members.list_by_ids_and_batch(ids, batch).await?;
        if members.len() != ids.len() {
            return Err(MemberError::NotFound);
        }
        Ok(members
            .into_iter()
            .map(|member| (member.id.clone(), member))
            .collect())
    }

    /// Checks whether an active member is registered under the student id.
    pub async fn member_exists_with_student_id(
        &self,
        student_id: &str,
    ) -> Result<bool, MemberError> {
        Ok(self.members.find_by_student_id(student_id).await?.is_some())
    }
}

/// Write-side orchestration for member registration and withdrawal.
#[derive(Clone)]
pub struct MemberService {
    finder: MemberFinder,
    members: MemberRepository,
    clock: Clock,
}

impl MemberService {
    pub fn new(database: &Database, clock: Clock) -> Self {
        Self {
            finder: MemberFinder::new(database),
            members: database.members(),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn finder(&self) -> &MemberFinder {
        &self.finder
    }

    /// Registers a single member with a fresh student id.
    pub async fn register(&self, command: &MemberCreateCommand) -> Result<Member, MemberError> {
        if self
            .finder
            .member_exists_with_student_id(&command.student_id)
            .await?
        {
            counter!("member_registrations_total", "result" => "duplicate").increment(1);
            return Err(MemberError::AlreadyExists {
                student_ids: vec![command.student_id.clone()],
            });
        }

        let member = build_member(command, self.now());
        match self.members.insert(&member_record(&member)).await {
            Ok(()) => {}
            Err(MemberStoreError::DuplicateStudentId) => {
                counter!("member_registrations_total", "result" => "duplicate").increment(1);
                return Err(MemberError::AlreadyExists {
                    student_ids: vec![command.student_id.clone()],
                });
            }
            Err(other) => return Err(other.into()),
        }

        counter!("member_registrations_total", "result" => "registered").increment(1);
        info!(stage = "members", member_id = %member.id, batch = %member.batch, "registered member");
        Ok(member)
    }

    /// Registers a list of members as a single batch.
    ///
    /// Fails up-front when any student id is already taken; in that case
    /// nothing is persisted and the offending ids are reported.
    pub async fn bulk_register(
        &self,
        commands: &[MemberCreateCommand],
    ) -> Result<Vec<Member>, MemberError> {
        let student_ids: Vec<String> = commands
            .iter()
            .map(|command| command.student_id.clone())
            .collect();

        let existing = self.finder.filter_existing_student_ids(&student_ids).await?;
        if !existing.is_empty() {
            counter!("member_registrations_total", "result" => "duplicate").increment(1);
            return Err(MemberError::AlreadyExists {
                student_ids: existing,
            });
        }

        let now = self.now();
        let members: Vec<Member> = commands
            .iter()
            .map(|command| build_member(command, now))
            .collect();
        let records: Vec<NewMember<'_>> = members.iter().map(member_record).collect();

        self.members
            .insert_batch(&records)
            .await
            .map_err(|err| match err {
                MemberStoreError::DuplicateStudentId => MemberError::AlreadyExists {
                    student_ids: student_ids.clone(),
                },
                other => MemberError::from(other),
            })?;

        counter!("member_registrations_total", "result" => "registered")
            .increment(members.len() as u64);
        info!(stage = "members", count = members.len(), "bulk registered members");
        Ok(members)
    }

    /// Soft-deletes a member.
    ///
    /// Withdrawal is one-way: withdrawing an already deleted member fails.
    pub async fn withdraw(&self, id: &str) -> Result<(), MemberError> {
        let member = self.finder.fetch_member_by_id(id).await?;
        if member.is_deleted() {
            return Err(MemberError::AlreadyDeleted);
        }

        self.members.mark_deleted(id, self.now()).await?;
        counter!("member_withdrawals_total").increment(1);
        info!(stage = "members", member_id = %id, "member withdrew");
        Ok(())
    }
}

fn build_member(command: &MemberCreateCommand, now: DateTime<Utc>) -> Member {
    Member {
        id: Uuid::new_v4().to_string(),
        name: command.name.clone(),
        email: command.email.clone(),
        student_id: command.student_id.clone(),
        department: command.department.clone(),
        batch: command.batch.clone(),
        status: MemberStatus::Active,
        soft_deleted_at: None,
        created_at: now,
    }
}

fn member_record(member: &Member) -> NewMember<'_> {
    NewMember {
        id: &member.id,
        name: &member.name,
        email: &member.email,
        student_id: &member.student_id,
        department: &member.department,
        batch: &member.batch,
        created_at: member.created_at,
    }
}

/// Errors raised by member registration and withdrawal.
#[derive(Debug, Error)]
pub enum MemberError {
    #[error("member not found")]
    NotFound,
    #[error("student ids already registered: {}", student_ids.join(", "))]
    AlreadyExists { student_ids: Vec<String> },
    #[error("member is already deleted")]
    AlreadyDeleted,
    #[error("storage error: {0}")]
    Storage(#[from] MemberStoreError),
}
