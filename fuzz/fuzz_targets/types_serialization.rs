#![no_main]

use libfuzzer_sys::fuzz_target;
use agentrelay_types::Task;
use agentrelay_webhook::WebhookEvent;

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(task) = serde_json::from_str::<Task>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&task) {
            if let Ok(parsed) = serde_json::from_str::<Task>(&roundtripped) {
                assert_eq!(task.id, parsed.id);
                assert_eq!(task.logs.len(), parsed.logs.len());
            }
        }
    }

    if let Ok(event) = serde_json::from_str::<WebhookEvent>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&event) {
            if let Ok(parsed) = serde_json::from_str::<WebhookEvent>(&roundtripped) {
                assert_eq!(event.repository.owner, parsed.repository.owner);
                assert_eq!(event.issue.number, parsed.issue.number);
            }
        }
    }
});
