use k8s_openapi::api::networking::v1::NetworkPolicy;
use log::{debug, info};

use crate::watcher::ObjectEvent;

/// Network policies are watched but not enforced.
pub fn observe_policy(event: ObjectEvent<NetworkPolicy>) {
    match &event {
        ObjectEvent::Added(_) => info!("Network policy '{}' observed, policies aren't enforced", event.key()),
        ObjectEvent::Updated { .. } => debug!("Network policy '{}' updated", event.key()),
        ObjectEvent::Deleted(_) => debug!("Network policy '{}' deleted", event.key()),
    }
}
