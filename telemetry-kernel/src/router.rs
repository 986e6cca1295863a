/**
 * ROUTEUR DE TOPICS - Table déclarative topic -> (device, channel)
 *
 * ROLE :
 * Remplace les comparaisons de topics codées en dur par une table de règles
 * chargée depuis la config. Chaque règle = pattern + device + channel + mode de décodage.
 *
 * FONCTIONNEMENT :
 * - Règles exactes consultées en premier (HashMap)
 * - Puis patterns dans l'ordre de déclaration, première règle qui matche gagne
 * - Syntaxe des patterns : segments littéraux, `+` (un niveau), `#` (fin, multi-niveaux),
 *   `{device}` (un niveau, capture l'id du device, préfixe/suffixe littéraux autorisés :
 *   `{device}_hand`)
 * - Deux règles au pattern identique mais à cible différente => ConfigError au démarrage
 * - Patterns qui peuvent se recouvrir => warning au démarrage (l'ordre tranche)
 */

use crate::config::{ChannelConf, RouteConf};
use crate::decoder::DecodeMode;
use crate::error::ConfigError;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

const DEVICE_CAPTURE: &str = "{device}";

/// Cible résolue pour un topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub device_id: String,
    pub channel: String,
    pub decode: DecodeMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteResult {
    Matched(Route),
    /// Topic ignoré, pas une erreur
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Single,
    Multi,
    Capture { prefix: String, suffix: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DeviceSource {
    Fixed(String),
    Captured,
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    segments: Vec<Segment>,
    device: DeviceSource,
    channel: String,
    decode: DecodeMode,
}

impl Rule {
    fn same_target(&self, other: &Rule) -> bool {
        self.device == other.device && self.channel == other.channel && self.decode == other.decode
    }

    fn describe(&self) -> String {
        match &self.device {
            DeviceSource::Fixed(id) => format!("{id}/{}", self.channel),
            DeviceSource::Captured => format!("{DEVICE_CAPTURE}/{}", self.channel),
        }
    }

    fn resolve(&self, captured: Option<&str>) -> Option<Route> {
        let device_id = match (&self.device, captured) {
            (DeviceSource::Fixed(id), _) => id.clone(),
            (DeviceSource::Captured, Some(id)) => id.to_string(),
            (DeviceSource::Captured, None) => return None,
        };
        Some(Route {
            device_id,
            channel: self.channel.clone(),
            decode: self.decode,
        })
    }

    /// `None` si pas de match ; `Some(capture)` sinon
    fn matches<'t>(&self, topic: &'t str) -> Option<Option<&'t str>> {
        let parts: Vec<&str> = topic.split('/').collect();
        let mut captured = None;

        for (i, segment) in self.segments.iter().enumerate() {
            if *segment == Segment::Multi {
                // `a/#` matche aussi `a`
                return Some(captured);
            }
            let part = *parts.get(i)?;
            match segment {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                }
                Segment::Single | Segment::Multi => {}
                Segment::Capture { prefix, suffix } => {
                    if part.len() <= prefix.len() + suffix.len()
                        || !part.starts_with(prefix.as_str())
                        || !part.ends_with(suffix.as_str())
                    {
                        return None;
                    }
                    captured = Some(&part[prefix.len()..part.len() - suffix.len()]);
                }
            }
        }

        (parts.len() == self.segments.len()).then_some(captured)
    }

    fn subscription_filter(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(lit) => lit.as_str(),
                Segment::Single | Segment::Capture { .. } => "+",
                Segment::Multi => "#",
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[derive(Debug, Clone)]
pub struct TopicRouter {
    exact: HashMap<String, Rule>,
    patterns: Vec<Rule>,
    filters: Vec<String>,
}

impl TopicRouter {
    /// Construit la table ; échoue vite sur toute ambiguïté
    pub fn from_rules(
        routes: &[RouteConf],
        channels: &BTreeMap<String, ChannelConf>,
    ) -> Result<Self, ConfigError> {
        let mut router = TopicRouter {
            exact: HashMap::new(),
            patterns: Vec::new(),
            filters: Vec::new(),
        };

        for conf in routes {
            if !channels.contains_key(&conf.channel) {
                return Err(ConfigError::Invalid(format!(
                    "route '{}' targets unknown channel '{}'",
                    conf.pattern, conf.channel
                )));
            }
            let rule = parse_rule(conf)?;
            router.insert(rule)?;
        }

        Ok(router)
    }

    fn insert(&mut self, rule: Rule) -> Result<(), ConfigError> {
        let is_exact = rule.segments.iter().all(|s| matches!(s, Segment::Literal(_)));
        let existing = if is_exact {
            self.exact.get(&rule.pattern)
        } else {
            self.patterns.iter().find(|r| r.pattern == rule.pattern)
        };

        if let Some(existing) = existing {
            if existing.same_target(&rule) {
                debug!("[router] duplicate rule for '{}' ignored", rule.pattern);
                return Ok(());
            }
            return Err(ConfigError::Invalid(format!(
                "topic '{}' routed to both {} and {}",
                rule.pattern,
                existing.describe(),
                rule.describe()
            )));
        }

        if is_exact {
            for earlier in &self.patterns {
                if earlier.matches(&rule.pattern).is_some() {
                    debug!(
                        "[router] exact rule '{}' shadows pattern '{}'",
                        rule.pattern, earlier.pattern
                    );
                }
            }
        } else {
            for earlier in &self.patterns {
                if !earlier.same_target(&rule) && may_overlap(&earlier.segments, &rule.segments) {
                    warn!(
                        "[router] patterns '{}' ({}) and '{}' ({}) overlap; '{}' wins on common topics",
                        earlier.pattern,
                        earlier.describe(),
                        rule.pattern,
                        rule.describe(),
                        earlier.pattern
                    );
                }
            }
        }

        let filter = rule.subscription_filter();
        if !self.filters.contains(&filter) {
            self.filters.push(filter);
        }

        if is_exact {
            self.exact.insert(rule.pattern.clone(), rule);
        } else {
            self.patterns.push(rule);
        }
        Ok(())
    }

    pub fn route(&self, topic: &str) -> RouteResult {
        if let Some(rule) = self.exact.get(topic) {
            if let Some(route) = rule.resolve(None) {
                return RouteResult::Matched(route);
            }
        }

        for rule in &self.patterns {
            if let Some(captured) = rule.matches(topic) {
                if let Some(route) = rule.resolve(captured) {
                    return RouteResult::Matched(route);
                }
            }
        }

        RouteResult::NoMatch
    }

    /// Filtres MQTT à souscrire, dédupliqués, dans l'ordre de déclaration
    pub fn subscription_filters(&self) -> &[String] {
        &self.filters
    }

    pub fn rule_count(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }
}

fn parse_rule(conf: &RouteConf) -> Result<Rule, ConfigError> {
    let invalid = |why: &str| ConfigError::Invalid(format!("route '{}': {why}", conf.pattern));

    if conf.pattern.is_empty() {
        return Err(invalid("empty pattern"));
    }

    let raw_segments: Vec<&str> = conf.pattern.split('/').collect();
    let mut segments = Vec::with_capacity(raw_segments.len());
    let mut captures = 0;

    for (i, seg) in raw_segments.iter().enumerate() {
        let segment = match *seg {
            "#" if i + 1 == raw_segments.len() => Segment::Multi,
            "#" => return Err(invalid("'#' must be the last segment")),
            "+" => Segment::Single,
            s if s.contains(DEVICE_CAPTURE) => {
                let (prefix, suffix) = s.split_once(DEVICE_CAPTURE).unwrap_or_default();
                if [prefix, suffix].iter().any(|p| p.contains(['+', '#', '{', '}'])) {
                    return Err(invalid("'{device}' segment contains wildcard characters"));
                }
                captures += 1;
                Segment::Capture {
                    prefix: prefix.to_string(),
                    suffix: suffix.to_string(),
                }
            }
            s if s.contains(['+', '#', '{', '}']) => {
                return Err(invalid("wildcards must occupy a whole segment"));
            }
            s => Segment::Literal(s.to_string()),
        };
        segments.push(segment);
    }

    if captures > 1 {
        return Err(invalid("at most one '{device}' capture"));
    }

    let device = match (&conf.device, captures) {
        (Some(_), 1) => return Err(invalid("both a literal device and a '{device}' capture")),
        (Some(id), _) if id.trim().is_empty() => return Err(invalid("empty device id")),
        (Some(id), _) => DeviceSource::Fixed(id.clone()),
        (None, 1) => DeviceSource::Captured,
        (None, _) => return Err(invalid("no device: set 'device' or use '{device}'")),
    };

    Ok(Rule {
        pattern: conf.pattern.clone(),
        segments,
        device,
        channel: conf.channel.clone(),
        decode: conf.decode,
    })
}

fn may_overlap(a: &[Segment], b: &[Segment]) -> bool {
    match (a.first(), b.first()) {
        (Some(Segment::Multi), _) | (_, Some(Segment::Multi)) => true,
        (None, None) => true,
        (None, _) | (_, None) => false,
        (Some(x), Some(y)) => segments_overlap(x, y) && may_overlap(&a[1..], &b[1..]),
    }
}

fn segments_overlap(a: &Segment, b: &Segment) -> bool {
    use Segment::*;
    match (a, b) {
        (Single, _) | (_, Single) | (Multi, _) | (_, Multi) => true,
        (Literal(x), Literal(y)) => x == y,
        (Literal(lit), Capture { prefix, suffix }) | (Capture { prefix, suffix }, Literal(lit)) => {
            lit.len() > prefix.len() + suffix.len()
                && lit.starts_with(prefix.as_str())
                && lit.ends_with(suffix.as_str())
        }
        (Capture { prefix: p1, suffix: s1 }, Capture { prefix: p2, suffix: s2 }) => {
            (p1.starts_with(p2.as_str()) || p2.starts_with(p1.as_str()))
                && (s1.ends_with(s2.as_str()) || s2.ends_with(s1.as_str()))
        }
    }
}
