//! Ordered rule matching with grouped sub-rules and on-demand resolution.

use super::rules::Rule;
use super::script::{CompiledExpr, Script, ScriptEnv};
use crate::common::Metadata;
use crate::config::{GroupRuleConfig, RuleConfig, ScriptConfig};
use crate::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a successful classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub target: String,
    pub kind: String,
    pub payload: String,
    /// Names of the rule groups traversed, outermost first
    pub chain: Vec<String>,
}

enum EngineRule {
    Plain(Rule),
    Group(GroupRule),
}

struct GroupRule {
    name: String,
    matcher: Arc<CompiledExpr>,
    rules: Vec<EngineRule>,
}

/// The rule engine. The top-level list is strictly positional; the first
/// matching rule wins.
pub struct RuleEngine {
    rules: Vec<EngineRule>,
    env: ScriptEnv,
    /// `mode: script` entry point
    main_script: Option<Arc<Script>>,
    shortcuts: HashMap<String, Arc<CompiledExpr>>,
    /// Providers referenced from scripts; the loader pre-registers these
    referenced_providers: Vec<String>,
    /// SCRIPT rules already reported as failing, to log once per rule
    failed_scripts: Mutex<HashSet<String>>,
    rule_count: usize,
}

impl RuleEngine {
    pub fn build(
        rule_configs: &[RuleConfig],
        script_config: &ScriptConfig,
        env: ScriptEnv,
    ) -> Result<Self> {
        let mut shortcuts = HashMap::new();
        let mut referenced = Vec::new();

        for (name, src) in &script_config.shortcuts {
            let expr = Arc::new(
                CompiledExpr::compile(src)
                    .map_err(|e| Error::config(format!("shortcut {}: {}", name, e)))?,
            );
            referenced.extend(expr.referenced_providers().iter().cloned());
            shortcuts.insert(name.clone(), expr);
        }

        let main_script = match &script_config.code {
            Some(code) => {
                let script = Arc::new(
                    Script::compile(code)
                        .map_err(|e| Error::config(format!("script.code: {}", e)))?,
                );
                referenced.extend(script.referenced_providers().iter().cloned());
                Some(script)
            }
            None => None,
        };

        let mut group_names = HashSet::new();
        let mut rule_count = 0;
        let rules = compile_rules(
            rule_configs,
            &shortcuts,
            &mut group_names,
            &mut referenced,
            &mut rule_count,
        )?;

        referenced.sort();
        referenced.dedup();

        Ok(RuleEngine {
            rules,
            env,
            main_script,
            shortcuts,
            referenced_providers: referenced,
            failed_scripts: Mutex::new(HashSet::new()),
            rule_count,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    pub fn has_main_script(&self) -> bool {
        self.main_script.is_some()
    }

    /// Provider names that scripts reference; auto-registered by the loader.
    pub fn referenced_providers(&self) -> &[String] {
        &self.referenced_providers
    }

    pub fn shortcut(&self, name: &str) -> Option<Arc<CompiledExpr>> {
        self.shortcuts.get(name).cloned()
    }

    /// Classify `metadata` against the ordered rule list.
    ///
    /// IP rules without `no-resolve` trigger one on-demand resolution whose
    /// result is cached on the metadata for the rest of the walk. Returns
    /// None when nothing matched; the dispatcher resolves that to DIRECT.
    pub async fn match_rules(&self, metadata: &mut Metadata) -> Option<RuleMatch> {
        let mut resolution_tried = false;
        let mut chain = Vec::new();
        self.match_list(&self.rules, metadata, &mut resolution_tried, &mut chain)
            .await
    }

    /// Run the `mode: script` entry point.
    pub async fn run_main_script(&self, metadata: &Metadata) -> Result<String> {
        let script = self
            .main_script
            .as_ref()
            .ok_or_else(|| Error::script("no script.code configured"))?;
        script.run_main(metadata, &self.env).await
    }

    fn match_list<'a>(
        &'a self,
        rules: &'a [EngineRule],
        metadata: &'a mut Metadata,
        resolution_tried: &'a mut bool,
        chain: &'a mut Vec<String>,
    ) -> BoxFuture<'a, Option<RuleMatch>> {
        async move {
            for rule in rules {
                match rule {
                    EngineRule::Plain(rule) => {
                        if rule.needs_resolved_ip(&self.env)
                            && metadata.dst_ip.is_none()
                            && !*resolution_tried
                            && !metadata.host.is_empty()
                        {
                            *resolution_tried = true;
                            match self.env.resolver.resolve_ip(&metadata.host).await {
                                Ok(ip) => {
                                    debug!("resolved {} -> {} for ip rule", metadata.host, ip);
                                    metadata.dst_ip = Some(ip);
                                }
                                Err(e) => {
                                    debug!("on-demand resolve {} failed: {}", metadata.host, e)
                                }
                            }
                        }

                        match rule.matches(metadata, &self.env).await {
                            Ok(true) => {
                                return Some(RuleMatch {
                                    target: rule.target().to_string(),
                                    kind: rule.kind().to_string(),
                                    payload: rule.payload(),
                                    chain: chain.clone(),
                                });
                            }
                            Ok(false) => {}
                            Err(e) => self.report_script_failure(rule, &e),
                        }
                    }
                    EngineRule::Group(group) => {
                        let gate = match group.matcher.evaluate(metadata, &self.env).await {
                            Ok(hit) => hit,
                            Err(e) => {
                                warn!("rule group {} matcher failed: {}", group.name, e);
                                false
                            }
                        };
                        if !gate {
                            continue;
                        }

                        chain.push(group.name.clone());
                        if let Some(matched) = self
                            .match_list(&group.rules, metadata, resolution_tried, chain)
                            .await
                        {
                            return Some(matched);
                        }
                        chain.pop();
                    }
                }
            }
            None
        }
        .boxed()
    }

    fn report_script_failure(&self, rule: &Rule, err: &Error) {
        let key = format!("{}:{}", rule.kind(), rule.payload());
        if self.failed_scripts.lock().insert(key) {
            warn!("rule {:?} failed, treating as non-match: {}", rule, err);
        }
    }
}

fn compile_rules(
    configs: &[RuleConfig],
    shortcuts: &HashMap<String, Arc<CompiledExpr>>,
    group_names: &mut HashSet<String>,
    referenced: &mut Vec<String>,
    rule_count: &mut usize,
) -> Result<Vec<EngineRule>> {
    let mut rules = Vec::with_capacity(configs.len());
    for config in configs {
        match config {
            RuleConfig::Line(line) => {
                let rule = Rule::parse(line, shortcuts)?;
                if let Rule::Script { expr, .. } = &rule {
                    referenced.extend(expr.referenced_providers().iter().cloned());
                }
                *rule_count += 1;
                rules.push(EngineRule::Plain(rule));
            }
            RuleConfig::Group(group) => {
                rules.push(compile_group(
                    group,
                    shortcuts,
                    group_names,
                    referenced,
                    rule_count,
                )?);
            }
        }
    }
    Ok(rules)
}

fn compile_group(
    config: &GroupRuleConfig,
    shortcuts: &HashMap<String, Arc<CompiledExpr>>,
    group_names: &mut HashSet<String>,
    referenced: &mut Vec<String>,
    rule_count: &mut usize,
) -> Result<EngineRule> {
    if !group_names.insert(config.name.clone()) {
        return Err(Error::config(format!(
            "duplicate rule group name: {}",
            config.name
        )));
    }
    match config.engine.as_deref() {
        None | Some("expr") | Some("starlark") => {}
        Some(other) => {
            return Err(Error::config(format!(
                "rule group {}: unknown engine {}",
                config.name, other
            )))
        }
    }

    let matcher = Arc::new(
        CompiledExpr::compile(&config.condition)
            .map_err(|e| Error::config(format!("rule group {}: {}", config.name, e)))?,
    );
    referenced.extend(matcher.referenced_providers().iter().cloned());

    let rules = compile_rules(&config.rules, shortcuts, group_names, referenced, rule_count)?;
    *rule_count += 1;

    Ok(EngineRule::Group(GroupRule {
        name: config.name.clone(),
        matcher,
        rules,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SourceType;
    use crate::config::DnsConfig;
    use crate::dns::Resolver;
    use crate::geodata::GeoData;
    use crate::rule::script::ProviderMatch;
    use std::net::IpAddr;

    struct NoProviders;

    impl ProviderMatch for NoProviders {
        fn match_metadata(&self, _name: &str, _metadata: &Metadata) -> Option<bool> {
            None
        }

        fn match_ip(&self, _name: &str, _ip: IpAddr) -> Option<bool> {
            None
        }
    }

    fn env() -> ScriptEnv {
        ScriptEnv {
            resolver: Arc::new(
                Resolver::new(
                    &DnsConfig::default(),
                    &HashMap::new(),
                    Arc::new(GeoData::default()),
                    None,
                )
                .unwrap(),
            ),
            geodata: Arc::new(GeoData::default()),
            providers: Arc::new(NoProviders),
        }
    }

    fn engine(rules: &[&str]) -> RuleEngine {
        let configs: Vec<RuleConfig> = rules
            .iter()
            .map(|r| RuleConfig::Line(r.to_string()))
            .collect();
        RuleEngine::build(&configs, &ScriptConfig::default(), env()).unwrap()
    }

    fn meta(host: &str, port: u16) -> Metadata {
        Metadata::tcp(SourceType::Socks)
            .with_host(host)
            .with_dst_port(port)
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let engine = engine(&[
            "DOMAIN-SUFFIX,example.com,ProxyA",
            "DOMAIN-SUFFIX,example.com,ProxyB",
            "MATCH,DIRECT",
        ]);

        let mut m = meta("www.example.com", 443);
        let matched = engine.match_rules(&mut m).await.unwrap();
        assert_eq!(matched.target, "ProxyA");
        assert_eq!(matched.kind, "DOMAIN-SUFFIX");
    }

    #[tokio::test]
    async fn test_match_terminal_and_fallthrough() {
        let engine = engine(&["DOMAIN-SUFFIX,example.com,ProxyA", "MATCH,DIRECT"]);

        let mut m = meta("other.com", 443);
        let matched = engine.match_rules(&mut m).await.unwrap();
        assert_eq!(matched.target, "DIRECT");
        assert_eq!(matched.kind, "MATCH");

        // Without MATCH, classification yields None
        let engine = engine_no_match();
        let mut m = meta("other.com", 443);
        assert!(engine.match_rules(&mut m).await.is_none());
    }

    fn engine_no_match() -> RuleEngine {
        engine(&["DOMAIN,specific.example,Proxy"])
    }

    #[tokio::test]
    async fn test_no_resolve_inhibits_lookup() {
        // With no upstreams the resolver cannot answer, so a matching
        // IP rule with no-resolve must simply fall through.
        let engine = engine(&["IP-CIDR,10.0.0.0/8,LAN,no-resolve", "MATCH,DIRECT"]);
        let mut m = meta("intranet.local", 80);
        let matched = engine.match_rules(&mut m).await.unwrap();
        assert_eq!(matched.target, "DIRECT");
        assert!(m.dst_ip.is_none());
    }

    #[tokio::test]
    async fn test_ip_rule_matches_preresolved() {
        let engine = engine(&["IP-CIDR,10.0.0.0/8,LAN", "MATCH,DIRECT"]);
        let mut m = meta("intranet.local", 80);
        m.dst_ip = Some("10.1.2.3".parse().unwrap());
        let matched = engine.match_rules(&mut m).await.unwrap();
        assert_eq!(matched.target, "LAN");
    }

    #[tokio::test]
    async fn test_src_rules() {
        let engine = engine(&[
            "SRC-IP-CIDR,192.168.0.0/16,Home",
            "SRC-PORT,7000,Odd",
            "MATCH,DIRECT",
        ]);

        let mut m = meta("x.com", 443);
        m.src_ip = "192.168.3.4".parse().unwrap();
        assert_eq!(engine.match_rules(&mut m).await.unwrap().target, "Home");

        let mut m = meta("x.com", 443);
        m.src_port = 7000;
        assert_eq!(engine.match_rules(&mut m).await.unwrap().target, "Odd");
    }

    #[tokio::test]
    async fn test_grouped_rules_chain() {
        let yaml = r#"
- name: lan-tcp
  if: network == "tcp"
  rules:
    - DST-PORT,22,SSH
- MATCH,DIRECT
"#;
        let configs: Vec<RuleConfig> = serde_yaml::from_str(yaml).unwrap();
        let engine = RuleEngine::build(&configs, &ScriptConfig::default(), env()).unwrap();

        let mut m = meta("x.com", 22);
        let matched = engine.match_rules(&mut m).await.unwrap();
        assert_eq!(matched.target, "SSH");
        assert_eq!(matched.chain, vec!["lan-tcp".to_string()]);

        // Gate false: sub-rules skipped entirely
        let mut m = Metadata::udp(SourceType::Socks)
            .with_host("x.com")
            .with_dst_port(22);
        let matched = engine.match_rules(&mut m).await.unwrap();
        assert_eq!(matched.target, "DIRECT");
        assert!(matched.chain.is_empty());
    }

    #[tokio::test]
    async fn test_nested_groups_inherit_chain() {
        let yaml = r#"
- name: outer
  if: network == "tcp"
  rules:
    - name: inner
      if: dst_port == 22
      rules:
        - DOMAIN-KEYWORD,git,Git
- MATCH,DIRECT
"#;
        let configs: Vec<RuleConfig> = serde_yaml::from_str(yaml).unwrap();
        let engine = RuleEngine::build(&configs, &ScriptConfig::default(), env()).unwrap();

        let mut m = meta("git.example.com", 22);
        let matched = engine.match_rules(&mut m).await.unwrap();
        assert_eq!(matched.target, "Git");
        assert_eq!(matched.chain, vec!["outer".to_string(), "inner".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_group_names_rejected() {
        let yaml = r#"
- name: dup
  if: network == "tcp"
  rules: [ "MATCH,DIRECT" ]
- name: dup
  if: network == "udp"
  rules: [ "MATCH,DIRECT" ]
"#;
        let configs: Vec<RuleConfig> = serde_yaml::from_str(yaml).unwrap();
        assert!(RuleEngine::build(&configs, &ScriptConfig::default(), env()).is_err());
    }

    #[tokio::test]
    async fn test_script_shortcut_rule() {
        let mut script = ScriptConfig::default();
        script.shortcuts.insert(
            "quic".to_string(),
            r#"network == "udp" and dst_port == 443"#.to_string(),
        );
        let configs = vec![
            RuleConfig::Line("SCRIPT,quic,REJECT".to_string()),
            RuleConfig::Line("MATCH,DIRECT".to_string()),
        ];
        let engine = RuleEngine::build(&configs, &script, env()).unwrap();

        let mut m = Metadata::udp(SourceType::Socks)
            .with_host("x.com")
            .with_dst_port(443);
        assert_eq!(engine.match_rules(&mut m).await.unwrap().target, "REJECT");

        let mut m = meta("x.com", 443);
        assert_eq!(engine.match_rules(&mut m).await.unwrap().target, "DIRECT");
    }

    #[tokio::test]
    async fn test_script_mode_main() {
        let mut script = ScriptConfig::default();
        script.code = Some(
            r#"
def main(ctx, metadata):
    if dst_port == 22:
        return "SSH"
    return "DIRECT"
"#
            .to_string(),
        );
        let engine = RuleEngine::build(&[], &script, env()).unwrap();
        assert!(engine.has_main_script());

        assert_eq!(engine.run_main_script(&meta("x.com", 22)).await.unwrap(), "SSH");
        assert_eq!(
            engine.run_main_script(&meta("x.com", 80)).await.unwrap(),
            "DIRECT"
        );
    }

    #[test]
    fn test_referenced_providers_collected() {
        let mut script = ScriptConfig::default();
        script.shortcuts.insert(
            "tracked".to_string(),
            r#"match_provider("trackers")"#.to_string(),
        );
        let configs = vec![RuleConfig::Line("SCRIPT,tracked,REJECT".to_string())];
        let engine = RuleEngine::build(&configs, &script, env()).unwrap();
        assert_eq!(engine.referenced_providers(), &["trackers".to_string()]);
    }
}
