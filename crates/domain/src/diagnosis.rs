use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::ports::chat::ChatRepository;
use crate::ports::diagnosis::DiagnosisRepository;
use crate::util::now_ms;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Prescription {
    pub content: String,
    /// 1-based position within the prescription list.
    pub order_index: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Diagnosis {
    pub diagnosis_id: String,
    pub chat_id: String,
    pub requested_at_ms: i64,
    pub completed_at_ms: Option<i64>,
    /// Patient message range the run covers.
    pub from_message_id: String,
    pub to_message_id: String,
    pub diagnosed_problem: Option<String>,
    pub reasoning: Option<String>,
    pub prescriptions: Vec<Prescription>,
    pub failure_reason: Option<String>,
    pub deleted_at_ms: Option<i64>,
}

impl Diagnosis {
    pub fn is_completed(&self) -> bool {
        self.completed_at_ms.is_some()
    }

    /// Applies a structured outcome, setting exactly one of the success
    /// triple or the failure reason, plus the completion timestamp.
    pub fn apply_outcome(&mut self, outcome: DiagnosisOutcome) {
        match outcome {
            DiagnosisOutcome::Success {
                diagnosed_problem,
                reasoning,
                prescriptions,
            } => {
                self.diagnosed_problem = Some(diagnosed_problem);
                self.reasoning = Some(reasoning);
                self.prescriptions = prescriptions
                    .into_iter()
                    .enumerate()
                    .map(|(index, content)| Prescription {
                        content,
                        order_index: index as u32 + 1,
                    })
                    .collect();
                self.failure_reason = None;
            }
            DiagnosisOutcome::Failure { reason } => {
                self.diagnosed_problem = None;
                self.reasoning = None;
                self.prescriptions = Vec::new();
                self.failure_reason = Some(reason);
            }
        }
        self.completed_at_ms = Some(now_ms());
    }
}

/// Structured result of one diagnosis model call. The illegal mixed state
/// (success fields plus failure reason) cannot be represented.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiagnosisOutcome {
    Success {
        diagnosed_problem: String,
        reasoning: String,
        prescriptions: Vec<String>,
    },
    Failure {
        reason: String,
    },
}

/// Raw payload shape returned by the diagnosis model service.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisWire {
    pub succeeded: bool,
    #[serde(default)]
    pub diagnosed_problem: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub prescriptions: Option<Vec<String>>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl DiagnosisOutcome {
    /// Converts the wire payload, collapsing every contract violation into
    /// `Failure` so the illegal mixed state never reaches the store: a
    /// success missing any field, an empty prescription list, or any
    /// success/failure field mixing all count as violations.
    pub fn from_wire(wire: DiagnosisWire) -> Self {
        if wire.succeeded {
            let violation = wire.failure_reason.is_some();
            match (wire.diagnosed_problem, wire.reasoning, wire.prescriptions) {
                (Some(problem), Some(reasoning), Some(prescriptions))
                    if !violation
                        && !problem.trim().is_empty()
                        && !reasoning.trim().is_empty()
                        && !prescriptions.is_empty() =>
                {
                    DiagnosisOutcome::Success {
                        diagnosed_problem: problem,
                        reasoning,
                        prescriptions,
                    }
                }
                _ => DiagnosisOutcome::Failure {
                    reason: "diagnosis service returned a self-contradictory payload".to_string(),
                },
            }
        } else {
            let mixed = wire.diagnosed_problem.is_some()
                || wire.reasoning.is_some()
                || wire.prescriptions.as_ref().is_some_and(|p| !p.is_empty());
            match wire.failure_reason {
                Some(reason) if !mixed && !reason.trim().is_empty() => {
                    DiagnosisOutcome::Failure { reason }
                }
                _ => DiagnosisOutcome::Failure {
                    reason: "diagnosis service reported failure without a usable reason"
                        .to_string(),
                },
            }
        }
    }
}

/// Read/delete side of diagnoses; creation goes through the pipeline
/// orchestrator.
#[derive(Clone)]
pub struct DiagnosisService {
    diagnoses: Arc<dyn DiagnosisRepository>,
    chats: Arc<dyn ChatRepository>,
}

impl DiagnosisService {
    pub fn new(diagnoses: Arc<dyn DiagnosisRepository>, chats: Arc<dyn ChatRepository>) -> Self {
        Self { diagnoses, chats }
    }

    pub async fn list_for_chat(
        &self,
        actor: &ActorIdentity,
        chat_id: &str,
    ) -> DomainResult<Vec<Diagnosis>> {
        self.owned_chat_id(actor, chat_id).await?;
        self.diagnoses.list_by_chat(chat_id).await
    }

    pub async fn details(
        &self,
        actor: &ActorIdentity,
        diagnosis_id: &str,
    ) -> DomainResult<Diagnosis> {
        let diagnosis = self
            .diagnoses
            .get(diagnosis_id)
            .await?
            .filter(|diagnosis| diagnosis.deleted_at_ms.is_none())
            .ok_or(DomainError::NotFound)?;
        self.owned_chat_id(actor, &diagnosis.chat_id).await?;
        Ok(diagnosis)
    }

    /// Soft-deletes one completed diagnosis; pending runs cannot be removed.
    pub async fn delete_completed(
        &self,
        actor: &ActorIdentity,
        diagnosis_id: &str,
    ) -> DomainResult<()> {
        let mut diagnosis = self.details(actor, diagnosis_id).await?;
        if !diagnosis.is_completed() {
            return Err(DomainError::Validation(
                "diagnosis is still being generated".into(),
            ));
        }
        diagnosis.deleted_at_ms = Some(now_ms());
        self.diagnoses.update(&diagnosis).await?;
        Ok(())
    }

    pub async fn delete_all_completed(
        &self,
        actor: &ActorIdentity,
        chat_id: &str,
    ) -> DomainResult<usize> {
        self.owned_chat_id(actor, chat_id).await?;
        let mut removed = 0;
        for mut diagnosis in self.diagnoses.list_by_chat(chat_id).await? {
            if diagnosis.is_completed() && diagnosis.deleted_at_ms.is_none() {
                diagnosis.deleted_at_ms = Some(now_ms());
                self.diagnoses.update(&diagnosis).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn owned_chat_id(&self, actor: &ActorIdentity, chat_id: &str) -> DomainResult<()> {
        let chat = self
            .chats
            .get_chat(chat_id)
            .await?
            .filter(|chat| !chat.is_deleted())
            .ok_or(DomainError::NotFound)?;
        if chat.patient_id != actor.user_id {
            return Err(DomainError::NotFound);
        }
        Ok(())
    }
}
