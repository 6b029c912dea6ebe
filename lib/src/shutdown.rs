use axum::Extension;
use std::{
	future::Future,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};
use tokio::{signal, sync::watch};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("shutdown handler already created")]
pub struct AlreadyCreatedError;

static CREATED: AtomicBool = AtomicBool::new(false);

/// Process-wide shutdown signal, tripped by SIGINT/SIGTERM, the `/shutdown` route or a failed setup.
#[derive(Debug, Clone)]
pub struct Shutdown {
	sender: Arc<watch::Sender<bool>>,
	receiver: watch::Receiver<bool>,
}

impl Shutdown {
	/// Create the shutdown handler and install the signal handlers. Can only be called once.
	pub fn new() -> Result<Self, AlreadyCreatedError> {
		if CREATED.swap(true, Ordering::SeqCst) {
			return Err(AlreadyCreatedError);
		}

		let shutdown = Self::detached();

		let handle = shutdown.clone();
		tokio::spawn(async move {
			tokio::select! {
				() = register_handlers() => handle.start(),
				() = handle.handle() => {},
			}
		});

		Ok(shutdown)
	}

	/// A shutdown handle that only fires when [`Shutdown::start`] is called.
	pub fn detached() -> Self {
		let (sender, receiver) = watch::channel(false);

		Self {
			receiver,
			sender: Arc::new(sender),
		}
	}

	pub fn start(&self) {
		tracing::info!("Shutdown requested");
		self.sender.send_replace(true);
	}

	#[cfg(test)]
	pub fn is_started(&self) -> bool {
		*self.receiver.borrow()
	}

	/// Resolves once shutdown has started.
	pub fn handle(&self) -> impl Future<Output = ()> + Send + 'static {
		let mut receiver = self.receiver.clone();

		async move {
			while !*receiver.borrow_and_update() {
				if receiver.changed().await.is_err() {
					return;
				}
			}
		}
	}

	pub fn extension(&self) -> Extension<Self> {
		Extension(self.clone())
	}
}

async fn register_handlers() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			tracing::error!("Failed to install Ctrl+C handler: {e}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			},
			Err(e) => {
				tracing::error!("Failed to install SIGTERM handler: {e}");
				std::future::pending::<()>().await;
			},
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}

	tracing::info!("Received shutdown signal");
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn handle_resolves_after_start() {
		let shutdown = Shutdown::detached();
		let handle = shutdown.handle();

		assert!(!shutdown.is_started());
		shutdown.clone().start();

		tokio::time::timeout(Duration::from_secs(1), handle)
			.await
			.expect("shutdown handle did not resolve");
		assert!(shutdown.is_started());

		// handles created after the fact resolve immediately
		tokio::time::timeout(Duration::from_secs(1), shutdown.handle())
			.await
			.unwrap();
	}
}
