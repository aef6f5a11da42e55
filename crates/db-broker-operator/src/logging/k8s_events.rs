//! Publishes reconciliation failures as Kubernetes events.

use std::error::Error;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    runtime::{
        events::{Event, EventType, Recorder, Reporter},
        reflector::{Lookup, ObjectRef},
    },
};
use tracing::Instrument;

use super::controller::ReconcilerError;
use crate::client::Client;

/// Events API limit for the note.
const MAX_NOTE_BYTES: usize = 1024;

/// Joins `error` and all of its sources, so that the event says why a step failed.
fn failure_note(error: &dyn Error) -> String {
    let mut note = std::iter::successors(Some(error), |&error| error.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ");
    if note.len() > MAX_NOTE_BYTES {
        let mut end = MAX_NOTE_BYTES - '…'.len_utf8();
        while !note.is_char_boundary(end) {
            end -= 1;
        }
        note.truncate(end);
        note.push('…');
    }
    note
}

fn failure_event<E: ReconcilerError>(error: &E) -> Event {
    Event {
        type_: EventType::Warning,
        reason: error.category().to_owned(),
        note: Some(failure_note(error)),
        action: "Reconcile".to_owned(),
        secondary: None,
    }
}

/// Publishes `error` as a Warning event on `object` in the background.
pub fn publish_failure<K, E>(
    client: &Client,
    controller: &str,
    error: &E,
    object: &ObjectRef<K>,
) where
    K: Lookup,
    K::DynamicType: Clone,
    E: ReconcilerError,
{
    let recorder = Recorder::new(
        client.as_kube_client(),
        Reporter {
            controller: controller.to_owned(),
            instance: None,
        },
    );
    let reference: ObjectReference = object.clone().into();
    let event = failure_event(error);
    tokio::spawn(
        async move {
            if let Err(error) = recorder.publish(&event, &reference).await {
                tracing::warn!(
                    error = &error as &dyn Error,
                    "failed to publish reconciliation failure as event"
                );
            }
        }
        .in_current_span(),
    );
}

#[cfg(test)]
mod tests {
    use snafu::Snafu;
    use strum::EnumDiscriminants;

    use super::*;

    #[derive(Snafu, Debug, EnumDiscriminants)]
    #[strum_discriminants(derive(strum::IntoStaticStr))]
    enum ProvisionError {
        #[snafu(display("failed to provision broker"))]
        Provision { source: RemoteError },
    }

    #[derive(Snafu, Debug)]
    enum RemoteError {
        #[snafu(display("instance {instance:?} gave up"))]
        GaveUp { instance: String },
    }

    impl ReconcilerError for ProvisionError {
        fn category(&self) -> &'static str {
            ProvisionErrorDiscriminants::from(self).into()
        }
    }

    fn gave_up(instance: &str) -> ProvisionError {
        ProvisionError::Provision {
            source: RemoteError::GaveUp {
                instance: instance.to_owned(),
            },
        }
    }

    #[test]
    fn event_carries_category_and_error_chain() {
        let event = failure_event(&gave_up("w1-ns1"));

        assert!(matches!(event.type_, EventType::Warning));
        assert_eq!(event.reason, "Provision");
        assert_eq!(
            event.note.as_deref(),
            Some("failed to provision broker: instance \"w1-ns1\" gave up")
        );
    }

    #[test]
    fn long_notes_are_cut_on_a_char_boundary() {
        let note = failure_note(&gave_up(&"ü".repeat(800)));

        assert!(note.len() <= MAX_NOTE_BYTES);
        assert!(note.ends_with('…'));
    }
}
