//! Core data types for the channel model
//!
//! A [`Channel`] is one configured processing unit: a source [`Connector`],
//! an ordered list of destination connectors, and four lifecycle script
//! slots. Each connector owns an optional [`Filter`] (ordered [`Rule`]s,
//! first-true-wins) and an optional [`Transformer`] (ordered [`Step`]s applied
//! in sequence).
//!
//! All types deserialize directly from channel definition documents, with
//! the same defaults a hand-built value gets: connectors, rules and steps are
//! enabled unless stated otherwise.

use serde::{Deserialize, Serialize};

/// Host a listener binds to when none is configured
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

fn default_true() -> bool {
    true
}

fn default_listen_host() -> String {
    DEFAULT_LISTEN_HOST.to_string()
}

/// Whether a connector receives messages or delivers them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorMode {
    Source,
    #[default]
    Destination,
}

/// Transport a connector uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// MLLP over a listening TCP socket
    #[serde(alias = "TCP Listener")]
    TcpListener,
    /// Fed by another channel, no socket of its own
    #[serde(alias = "Channel Reader")]
    ChannelReader,
    /// Delivers to another channel
    #[serde(alias = "Channel Writer")]
    ChannelWriter,
    /// Any transport this engine does not drive itself
    #[default]
    #[serde(other)]
    Unmanaged,
}

impl TransportKind {
    /// Whether deploying a source with this transport starts a listener
    pub fn requires_listener(&self) -> bool {
        matches!(self, TransportKind::TcpListener)
    }
}

/// What a listening source sends back after processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// The transformed source message, re-encoded
    #[default]
    SourceMessage,
    /// Always a generated acknowledgment
    AutoAck,
}

/// Listen address of a TCP listener source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerProperties {
    #[serde(default = "default_listen_host")]
    pub host: String,
    /// Required for a listening source; checked at deploy time
    #[serde(default)]
    pub port: Option<u16>,
}

impl Default for ListenerProperties {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: None,
        }
    }
}

/// Transport-specific connector settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnectorProperties {
    #[serde(default)]
    pub listener: Option<ListenerProperties>,
    #[serde(default)]
    pub response: ResponseMode,
}

/// Script language tag of a rule or step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScriptKind {
    #[default]
    #[serde(alias = "JavaScript", alias = "script", alias = "rhai")]
    Script,
    /// Rule/step kinds without an executable script (skipped at runtime)
    #[serde(other)]
    Unsupported,
}

/// How a rule combines with the previous one in the editor model
///
/// Evaluation is always first-true-wins; the operator is kept for round-trip
/// fidelity of channel definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleOperator {
    #[default]
    None,
    And,
    Or,
}

/// One scripted boolean check of a filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub sequence_number: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ScriptKind,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub operator: RuleOperator,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Rule {
    /// Enabled script rule
    pub fn script(script: impl Into<String>) -> Self {
        Self {
            sequence_number: 0,
            name: String::new(),
            kind: ScriptKind::Script,
            script: script.into(),
            operator: RuleOperator::None,
            enabled: true,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Name for log output
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "Unnamed"
        } else {
            &self.name
        }
    }
}

/// Pass/fail gate of a connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Filter {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule (builder style)
    pub fn rule(mut self, mut rule: Rule) -> Self {
        rule.sequence_number = self.rules.len() as u32;
        self.rules.push(rule);
        self
    }

    pub fn enabled_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.enabled)
    }
}

/// One scripted mutation of a transformer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub sequence_number: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ScriptKind,
    #[serde(default)]
    pub script: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Step {
    /// Enabled script step
    pub fn script(script: impl Into<String>) -> Self {
        Self {
            sequence_number: 0,
            name: String::new(),
            kind: ScriptKind::Script,
            script: script.into(),
            enabled: true,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "Unnamed"
        } else {
            &self.name
        }
    }
}

/// Ordered message mutations of a connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Transformer {
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Transformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step (builder style)
    pub fn step(mut self, mut step: Step) -> Self {
        step.sequence_number = self.steps.len() as u32;
        self.steps.push(step);
        self
    }

    pub fn enabled_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.enabled)
    }
}

/// A source or destination endpoint of a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    pub name: String,
    #[serde(default)]
    pub meta_data_id: Option<u32>,
    #[serde(default)]
    pub mode: ConnectorMode,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub transformer: Transformer,
    /// Stored with the definition; not part of the message pipeline
    #[serde(default)]
    pub response_transformer: Transformer,
    #[serde(default = "default_true")]
    pub wait_for_previous: bool,
    #[serde(default)]
    pub properties: ConnectorProperties,
}

impl Connector {
    fn with_mode(name: impl Into<String>, mode: ConnectorMode) -> Self {
        Self {
            name: name.into(),
            meta_data_id: None,
            mode,
            enabled: true,
            transport: TransportKind::Unmanaged,
            filter: Filter::default(),
            transformer: Transformer::default(),
            response_transformer: Transformer::default(),
            wait_for_previous: true,
            properties: ConnectorProperties::default(),
        }
    }

    /// Source connector with no transport
    pub fn source(name: impl Into<String>) -> Self {
        Self::with_mode(name, ConnectorMode::Source)
    }

    /// Destination connector with no transport
    pub fn destination(name: impl Into<String>) -> Self {
        Self::with_mode(name, ConnectorMode::Destination)
    }

    /// Source connector listening for MLLP on `host:port`
    pub fn tcp_listener(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let mut connector = Self::source(name);
        connector.transport = TransportKind::TcpListener;
        connector.properties.listener = Some(ListenerProperties {
            host: host.into(),
            port: Some(port),
        });
        connector
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_response(mut self, response: ResponseMode) -> Self {
        self.properties.response = response;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A named processing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub revision: u32,
    pub source_connector: Connector,
    #[serde(default)]
    pub destination_connectors: Vec<Connector>,
    #[serde(default)]
    pub preprocessing_script: String,
    #[serde(default)]
    pub postprocessing_script: String,
    #[serde(default)]
    pub deploy_script: String,
    #[serde(default)]
    pub undeploy_script: String,
}

impl Channel {
    /// New channel with an unmanaged source and no destinations
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            enabled: true,
            revision: 0,
            source_connector: Connector::source("sourceConnector"),
            destination_connectors: Vec::new(),
            preprocessing_script: String::new(),
            postprocessing_script: String::new(),
            deploy_script: String::new(),
            undeploy_script: String::new(),
        }
    }

    /// Channel id; fixed once the channel exists
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn with_source(mut self, mut connector: Connector) -> Self {
        connector.mode = ConnectorMode::Source;
        self.source_connector = connector;
        self
    }

    /// Append a destination; order defines fan-out order
    pub fn with_destination(mut self, mut connector: Connector) -> Self {
        connector.mode = ConnectorMode::Destination;
        if connector.meta_data_id.is_none() {
            connector.meta_data_id = Some(self.destination_connectors.len() as u32 + 1);
        }
        self.destination_connectors.push(connector);
        self
    }

    pub fn enabled_destinations(&self) -> impl Iterator<Item = &Connector> {
        self.destination_connectors.iter().filter(|c| c.enabled)
    }
}
