use std::sync::Arc;

use anyhow::{Context, Error};
use tracing::{error, info};

use crate::assistant::{AssistantDispatcher, ConversationContext, Messaging};
use crate::config::EngineConfig;
use crate::engine::{ChatDispatcher, EngineDirectory, EngineManager};
use crate::frontend::EndpointTable;
use crate::model::UserStore;
use crate::webhook::WebhookDispatcher;

/// The assembled cloud backend: engine supervisor plus chat dispatcher.
#[derive(Debug, Default)]
pub struct App {
    manager: Option<Arc<EngineManager>>,
    dispatcher: Option<Arc<AssistantDispatcher>>,
    endpoints: Arc<EndpointTable>,
    webhooks: Arc<WebhookDispatcher>,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wires the components together and starts every engine and
    /// conversation.
    pub async fn bootstrap(
        &mut self,
        config: EngineConfig,
        store: Arc<dyn UserStore>,
        messaging: Arc<dyn Messaging>,
    ) -> Result<(), Error> {
        std::fs::create_dir_all(&config.root)
            .with_context(|| format!("could not create engine root {}", config.root.display()))?;

        let manager = EngineManager::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&self.webhooks),
            self.endpoints.clone(),
        );
        let ctx = Arc::new(ConversationContext {
            messaging,
            store,
            engines: manager.clone() as Arc<dyn EngineDirectory>,
            origin: config.origin.clone(),
            picture_poll_interval: config.picture_poll_interval,
            picture_poll_attempts: config.picture_poll_attempts,
        });
        let dispatcher = AssistantDispatcher::new(ctx, config.conversation_delay);
        manager.set_chat_dispatcher(&(dispatcher.clone() as Arc<dyn ChatDispatcher>));
        self.manager = Some(manager.clone());
        self.dispatcher = Some(dispatcher.clone());

        if let Err(err) = manager.start().await {
            error!("Could not start engines because {err}");
            return Err(err.into());
        }
        info!(pool = manager.shared_processes().len(), "engine manager started");

        if let Err(err) = dispatcher.start().await {
            error!("Could not start assistant dispatcher because {err}");
            return Err(err.into());
        }
        info!(feeds = dispatcher.get_all_feeds().len(), "assistant dispatcher started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.stop().await;
        }
        if let Some(manager) = &self.manager {
            manager.stop().await;
        }
        info!("all engines stopped");
    }

    pub fn manager(&self) -> Option<&Arc<EngineManager>> {
        self.manager.as_ref()
    }

    pub fn dispatcher(&self) -> Option<&Arc<AssistantDispatcher>> {
        self.dispatcher.as_ref()
    }

    pub fn endpoints(&self) -> &Arc<EndpointTable> {
        &self.endpoints
    }

    pub fn webhooks(&self) -> &Arc<WebhookDispatcher> {
        &self.webhooks
    }
}
