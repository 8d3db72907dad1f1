// Copyright 2024 Atlas Relayer Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! Out-of-band operator notifications.
//!
//! Alerts are a side channel: they may be lost, they never gate the
//! pipeline, and they carry no correctness weight. Delivery is
//! fire-and-forget to an optional webhook, with the log line as the
//! fallback that always happens.

use serde::Serialize;

/// Posts alerts to an optional webhook.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    hook: Option<url::Url>,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct AlertBody<'a> {
    text: &'a str,
}

impl Notifier {
    /// A notifier that posts to `hook` when one is configured, and only
    /// logs otherwise.
    pub fn new(hook: Option<url::Url>) -> Self {
        Self {
            hook,
            http: reqwest::Client::new(),
        }
    }

    /// Emits an alert. Always logs; posting to the webhook happens in the
    /// background and its failure is itself only logged.
    pub fn alert(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::error!(alert = true, "{}", text);
        let Some(hook) = self.hook.clone() else {
            return;
        };
        let http = self.http.clone();
        tokio::spawn(async move {
            let body = AlertBody { text: &text };
            if let Err(e) = http.post(hook).json(&body).send().await {
                tracing::warn!("failed to deliver alert to webhook: {}", e);
            }
        });
    }
}
