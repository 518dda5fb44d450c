//! Streaming council runs.
//!
//! The pipeline is identical to [`super::run_full_council`], but progress is
//! emitted as ordered events so a transport layer can forward them (e.g. as
//! server-sent events) while the stages are still running. Exactly one
//! terminal event (`complete` or `error`) is emitted per session.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::gateway::ChatGateway;

use super::types::{
    AggregateRankingEntry, CouncilRequest, ModelResponse, RankingSubmission, SynthesisResult,
};
use super::{
    aggregate_rankings, dedup_members, generate_title, stage1_dispatch, stage2_collect_rankings,
    stage3_synthesize, CouncilError, DEFAULT_CHAIRMAN_MODEL, DEFAULT_MEMBER_TIMEOUT,
};

/// Progress events, strictly ordered by stage.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouncilEvent {
    Stage1Start,
    Stage1Complete {
        data: Vec<ModelResponse>,
    },
    Stage2Start,
    Stage2Complete {
        data: Vec<RankingSubmission>,
        label_to_model: BTreeMap<String, String>,
        aggregate_rankings: Vec<AggregateRankingEntry>,
    },
    Stage3Start,
    Stage3Complete {
        data: SynthesisResult,
    },
    TitleComplete {
        title: String,
    },
    Complete,
    Error {
        code: String,
        message: String,
    },
}

impl CouncilEvent {
    /// The wire-level event name (the serde `type` tag).
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Stage1Start => "stage1_start",
            Self::Stage1Complete { .. } => "stage1_complete",
            Self::Stage2Start => "stage2_start",
            Self::Stage2Complete { .. } => "stage2_complete",
            Self::Stage3Start => "stage3_start",
            Self::Stage3Complete { .. } => "stage3_complete",
            Self::TitleComplete { .. } => "title_complete",
            Self::Complete => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error { .. })
    }
}

/// Run the council pipeline, emitting events as stages complete.
///
/// The returned stream ends after the terminal event. If the caller drops
/// the stream early, in-flight provider calls are not cancelled; their
/// results are simply discarded.
pub fn run_council_streaming(
    gateway: Arc<dyn ChatGateway>,
    req: CouncilRequest,
) -> ReceiverStream<CouncilEvent> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(drive(gateway, req, tx));
    ReceiverStream::new(rx)
}

async fn drive(
    gateway: Arc<dyn ChatGateway>,
    req: CouncilRequest,
    tx: mpsc::Sender<CouncilEvent>,
) {
    let members = dedup_members(&req.members);
    if members.is_empty() {
        let err = CouncilError::InvalidRequest("council requires at least one member".into());
        emit(&tx, error_event(&err)).await;
        return;
    }
    let timeout = req.member_timeout.unwrap_or(DEFAULT_MEMBER_TIMEOUT);

    // Title generation overlaps the whole pipeline; joined after stage 3.
    let title_task = {
        let gateway = gateway.clone();
        let prompt = req.prompt.clone();
        tokio::spawn(async move { generate_title(gateway.as_ref(), &prompt).await })
    };

    emit(&tx, CouncilEvent::Stage1Start).await;
    let stage1 = stage1_dispatch(gateway.as_ref(), &req.prompt, &members, timeout).await;
    if stage1.is_empty() {
        // The detached title task finishes on its own; its result is discarded.
        emit(&tx, error_event(&CouncilError::ZeroQuorum)).await;
        return;
    }
    emit(
        &tx,
        CouncilEvent::Stage1Complete {
            data: stage1.clone(),
        },
    )
    .await;

    emit(&tx, CouncilEvent::Stage2Start).await;
    let (stage2, assignment) =
        stage2_collect_rankings(gateway.as_ref(), &req.prompt, &stage1, timeout).await;
    let aggregate = aggregate_rankings(&stage2, &assignment);
    emit(
        &tx,
        CouncilEvent::Stage2Complete {
            data: stage2,
            label_to_model: assignment.to_map(),
            aggregate_rankings: aggregate.clone(),
        },
    )
    .await;

    emit(&tx, CouncilEvent::Stage3Start).await;
    let chairman = req.chairman.as_deref().unwrap_or(DEFAULT_CHAIRMAN_MODEL);
    match stage3_synthesize(
        gateway.as_ref(),
        &req.prompt,
        &stage1,
        &aggregate,
        &assignment,
        chairman,
    )
    .await
    {
        Ok(stage3) => {
            emit(&tx, CouncilEvent::Stage3Complete { data: stage3 }).await;
        }
        Err(err) => {
            emit(&tx, error_event(&err)).await;
            return;
        }
    }

    let title = match title_task.await {
        Ok(title) => title,
        Err(_) => super::fallback_title(&req.prompt),
    };
    emit(&tx, CouncilEvent::TitleComplete { title }).await;

    emit(&tx, CouncilEvent::Complete).await;
}

/// Send an event, ignoring a dropped receiver: a disconnected caller just
/// stops observing, it does not abort the run.
async fn emit(tx: &mpsc::Sender<CouncilEvent>, event: CouncilEvent) {
    let _ = tx.send(event).await;
}

fn error_event(err: &CouncilError) -> CouncilEvent {
    CouncilEvent::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_type_tags() {
        let json = serde_json::to_value(CouncilEvent::Stage1Start).unwrap();
        assert_eq!(json["type"], "stage1_start");

        let json = serde_json::to_value(CouncilEvent::TitleComplete {
            title: "t".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "title_complete");
        assert_eq!(json["title"], "t");

        let json = serde_json::to_value(CouncilEvent::Error {
            code: "zero_quorum".into(),
            message: "no council member responded".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "zero_quorum");
    }

    #[test]
    fn event_type_matches_serde_tag() {
        for event in [
            CouncilEvent::Stage1Start,
            CouncilEvent::Stage2Start,
            CouncilEvent::Stage3Start,
            CouncilEvent::Complete,
        ] {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
        }
    }

    #[test]
    fn terminal_events_are_exactly_complete_and_error() {
        assert!(CouncilEvent::Complete.is_terminal());
        assert!(CouncilEvent::Error {
            code: "x".into(),
            message: "y".into()
        }
        .is_terminal());
        assert!(!CouncilEvent::Stage1Start.is_terminal());
        assert!(!CouncilEvent::TitleComplete { title: "t".into() }.is_terminal());
    }
}
