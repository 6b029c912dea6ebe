use std::env;

use anyhow::Result;
use axum::http::{HeaderMap, HeaderValue};
use reqwest::Client;
use segserve_core::http::{Request, Response, WebhookEvent};
use url::Url;

pub struct WebhookSender {
	client: Client,
}

impl WebhookSender {
	/// Build the webhook client, authenticating with `WEBHOOK_AUTH_TOKEN` when it is set.
	pub fn new() -> Result<Self> {
		let mut headers = HeaderMap::new();
		let client = Client::builder();

		if let Ok(token) = env::var("WEBHOOK_AUTH_TOKEN") {
			let mut authorization = HeaderValue::from_str(&format!("Bearer {token}"))?;
			authorization.set_sensitive(true);
			headers.insert("Authorization", authorization);
		}

		Ok(Self {
			client: client
				.user_agent(format!("segserve/{}", env!("CARGO_PKG_VERSION")))
				.default_headers(headers)
				.build()?,
		})
	}

	pub async fn starting(&self, id: Option<String>, req: &Request) -> Result<()> {
		let Some(url) = Self::target(req, WebhookEvent::Start) else {
			return Ok(());
		};

		self.send(url, Response::starting(id, req.clone())).await
	}

	pub async fn finished(&self, req: &Request, response: Response) -> Result<()> {
		let Some(url) = Self::target(req, WebhookEvent::Completed) else {
			return Ok(());
		};

		self.send(url, response).await
	}

	fn target(req: &Request, event: WebhookEvent) -> Option<Url> {
		let filtered_out = req
			.webhook_event_filters
			.as_ref()
			.is_some_and(|filters| !filters.contains(&event));

		if filtered_out {
			return None;
		}

		req.webhook.clone()
	}

	async fn send(&self, url: Url, res: Response) -> Result<()> {
		tracing::debug!("Sending webhook to {url}");
		tracing::trace!("{res:?}");

		self.client
			.post(url)
			.json(&res)
			.send()
			.await?
			.error_for_status()?;

		Ok(())
	}
}
