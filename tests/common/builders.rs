//! Test data builders for creating test objects

use hl7_engine::types::{Channel, Connector, Filter, ResponseMode, Rule, Step, Transformer};

/// Builder for creating test Channels
pub struct ChannelBuilder {
    channel: Channel,
    source: Connector,
}

impl ChannelBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            channel: Channel::new(id, format!("Test channel {id}")),
            source: Connector::source("Source"),
        }
    }

    /// Listen on an ephemeral local port
    pub fn listening(mut self) -> Self {
        let mut source = Connector::tcp_listener("Listener", "127.0.0.1", 0);
        source.filter = std::mem::take(&mut self.source.filter);
        source.transformer = std::mem::take(&mut self.source.transformer);
        source.properties.response = self.source.properties.response;
        self.source = source;
        self
    }

    pub fn response(mut self, response: ResponseMode) -> Self {
        self.source.properties.response = response;
        self
    }

    pub fn source_rule(mut self, script: &str) -> Self {
        self.source.filter = std::mem::take(&mut self.source.filter).rule(Rule::script(script));
        self
    }

    pub fn source_step(mut self, script: &str) -> Self {
        self.source.transformer = std::mem::take(&mut self.source.transformer).step(Step::script(script));
        self
    }

    /// Destination with one transformer step
    pub fn destination(mut self, name: &str, step: &str) -> Self {
        let connector = Connector::destination(name).with_transformer(Transformer::new().step(Step::script(step)));
        self.channel = self.channel.with_destination(connector);
        self
    }

    /// Destination with one filter rule and no steps
    pub fn filtered_destination(mut self, name: &str, rule: &str) -> Self {
        let connector = Connector::destination(name).with_filter(Filter::new().rule(Rule::script(rule)));
        self.channel = self.channel.with_destination(connector);
        self
    }

    pub fn preprocessor(mut self, script: &str) -> Self {
        self.channel.preprocessing_script = script.to_string();
        self
    }

    pub fn postprocessor(mut self, script: &str) -> Self {
        self.channel.postprocessing_script = script.to_string();
        self
    }

    pub fn on_deploy(mut self, script: &str) -> Self {
        self.channel.deploy_script = script.to_string();
        self
    }

    pub fn on_undeploy(mut self, script: &str) -> Self {
        self.channel.undeploy_script = script.to_string();
        self
    }

    pub fn build(self) -> Channel {
        self.channel.with_source(self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hl7_engine::types::TransportKind;

    #[test]
    fn test_channel_builder() {
        let channel = ChannelBuilder::new("c1")
            .source_rule("true")
            .listening()
            .destination("Out", "1")
            .build();

        assert_eq!(channel.id(), "c1");
        assert_eq!(channel.source_connector.transport, TransportKind::TcpListener);
        assert_eq!(channel.source_connector.filter.rules.len(), 1);
        assert_eq!(channel.destination_connectors.len(), 1);
    }
}
