//! Investment recommendation: a 1-10 risk score with its contributing
//! factors, plus validation of the industry's market size.
//!
//! The score starts at [`BASE_RISK`] and every factor moves it by a fixed
//! weight. Factors only cite evidence already held by the session.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use diligence_state::{
    AgentKind, EvidenceContent, EvidenceId, EvidenceItem, EvidenceSource, SessionRecord,
};

use super::{Section, SectionStatus};

type Fields = BTreeMap<String, serde_json::Value>;

pub const BASE_RISK: i32 = 5;
pub const MIN_RISK: u8 = 1;
pub const MAX_RISK: u8 = 10;

const MARKET_SIZE_FIELDS: [&str; 2] = ["market_size_usd", "market_size"];
const MARKET_GROWTH_FIELDS: [&str; 2] = ["growth_rate", "growth"];
/// Market growth at or above this rate lowers risk.
const STRONG_MARKET_GROWTH: f64 = 0.10;
/// Team growth above this rate lowers risk.
const STRONG_TEAM_GROWTH: f64 = 0.20;
/// A competitor with this many times the startup's revenue is an incumbent.
const INCUMBENT_REVENUE_MULTIPLE: f64 = 10.0;
const CROWDED_FIELD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pursue,
    InvestigateFurther,
    Pass,
}

impl Verdict {
    pub fn from_risk(risk_score: u8) -> Self {
        match risk_score {
            0..=4 => Verdict::Pursue,
            5..=7 => Verdict::InvestigateFurther,
            _ => Verdict::Pass,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Pursue => "pursue",
            Verdict::InvestigateFurther => "investigate further",
            Verdict::Pass => "pass",
        };
        f.write_str(s)
    }
}

/// One input to the risk score. Positive weights add risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub description: String,
    pub weight: i32,
    pub citations: Vec<EvidenceId>,
}

impl RiskFactor {
    fn new(description: impl Into<String>, weight: i32, citations: Vec<EvidenceId>) -> Self {
        Self {
            description: description.into(),
            weight,
            citations,
        }
    }
}

/// Whether the industry's market size is backed by session evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSizeCheck {
    pub industry: String,
    pub market_size: Option<String>,
    pub growth: Option<String>,
    pub citation: Option<EvidenceId>,
    pub commentary: String,
}

impl MarketSizeCheck {
    pub fn is_validated(&self) -> bool {
        self.citation.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub risk_score: u8,
    pub verdict: Verdict,
    pub factors: Vec<RiskFactor>,
    pub market: MarketSizeCheck,
}

impl Recommendation {
    /// Every evidence id cited by the factors and the market check.
    pub fn cited_ids(&self) -> impl Iterator<Item = &EvidenceId> {
        self.factors
            .iter()
            .flat_map(|f| f.citations.iter())
            .chain(self.market.citation.iter())
    }
}

/// Score a finished session.
pub fn assess(record: &SessionRecord, sections: &[Section]) -> Recommendation {
    let mut factors = Vec::new();

    let summary_ok = sections
        .iter()
        .any(|s| s.kind == AgentKind::Summary && s.status == SectionStatus::Complete);
    if !summary_ok {
        factors.push(RiskFactor::new("No verified company summary", 2, vec![]));
    }
    for section in sections.iter().filter(|s| s.kind != AgentKind::Summary) {
        if section.is_insufficient() {
            factors.push(RiskFactor::new(
                format!("{} unavailable", section.title),
                1,
                vec![],
            ));
        }
    }

    let market = market_check(record);
    match &market.citation {
        Some(id) => {
            factors.push(RiskFactor::new(
                format!("{} market size on record", market.industry),
                -1,
                vec![id.clone()],
            ));
            let growth = market.growth.as_deref().and_then(parse_rate);
            if growth.is_some_and(|g| g >= STRONG_MARKET_GROWTH) {
                factors.push(RiskFactor::new("Fast-growing market", -1, vec![id.clone()]));
            }
        }
        None => factors.push(RiskFactor::new("Market size unverified", 1, vec![])),
    }

    factors.extend(competition_factors(record));

    let score = BASE_RISK + factors.iter().map(|f| f.weight).sum::<i32>();
    let risk_score = score.clamp(MIN_RISK as i32, MAX_RISK as i32) as u8;
    Recommendation {
        risk_score,
        verdict: Verdict::from_risk(risk_score),
        factors,
        market,
    }
}

fn rows(record: &SessionRecord) -> impl Iterator<Item = (&EvidenceItem, &Fields)> {
    record.evidence.values().filter_map(|item| match &item.content {
        EvidenceContent::Row { fields } if item.source == EvidenceSource::Structured => {
            Some((item, fields))
        }
        _ => None,
    })
}

fn field<'a>(
    fields: &'a Fields,
    names: &[&str],
) -> Option<&'a serde_json::Value> {
    names.iter().find_map(|name| fields.get(*name))
}

fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn str_field<'a>(fields: &'a Fields, name: &str) -> Option<&'a str> {
    fields.get(name).and_then(|v| v.as_str())
}

/// A fraction from `0.14`, `14` (read as percent) or `"14% CAGR"`.
pub fn parse_rate(raw: &str) -> Option<f64> {
    let number: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    let value: f64 = number.parse().ok()?;
    if raw.contains('%') || value > 1.0 {
        Some(value / 100.0)
    } else {
        Some(value)
    }
}

fn market_check(record: &SessionRecord) -> MarketSizeCheck {
    let industry = record.profile.industry.clone();
    let best = rows(record)
        .filter(|(_, fields)| {
            str_field(fields, "industry").is_some_and(|i| i.eq_ignore_ascii_case(&industry))
        })
        .filter_map(|(item, fields)| {
            field(fields, &MARKET_SIZE_FIELDS).map(|size| (item, fields, size))
        })
        .max_by(|a, b| a.0.score.total_cmp(&b.0.score).then_with(|| b.0.id.cmp(&a.0.id)));

    match best {
        Some((item, fields, size)) => {
            let market_size = render(size);
            let growth = field(fields, &MARKET_GROWTH_FIELDS).map(render);
            let commentary = match &growth {
                Some(g) => format!("The {industry} market is sized at {market_size}, growing {g}."),
                None => format!("The {industry} market is sized at {market_size}."),
            };
            MarketSizeCheck {
                industry,
                market_size: Some(market_size),
                growth,
                citation: Some(item.id.clone()),
                commentary,
            }
        }
        None => MarketSizeCheck {
            commentary: format!(
                "No market-size data for {industry} was found; the market size is unverified."
            ),
            industry,
            market_size: None,
            growth: None,
            citation: None,
        },
    }
}

fn competition_factors(record: &SessionRecord) -> Vec<RiskFactor> {
    let name = &record.profile.name;
    let mut own_revenue = None;
    let mut own_growth = None;
    let mut own_id = None;
    let mut competitors = Vec::new();

    for (item, fields) in rows(record) {
        let Some(row_name) = str_field(fields, "name") else {
            continue;
        };
        let revenue = fields.get("revenue").and_then(|v| v.as_f64());
        if row_name.eq_ignore_ascii_case(name) {
            own_revenue = revenue;
            own_growth = fields.get("employee_growth").and_then(|v| match v {
                serde_json::Value::String(s) => parse_rate(s),
                other => other.as_f64(),
            });
            own_id = Some(item.id.clone());
        } else {
            competitors.push((row_name.to_string(), revenue, item.id.clone()));
        }
    }
    competitors.sort_by(|a, b| a.0.cmp(&b.0));

    let mut factors = Vec::new();
    if let (Some(growth), Some(id)) = (own_growth, &own_id) {
        if growth > STRONG_TEAM_GROWTH {
            factors.push(RiskFactor::new(
                format!("Team growing {:.0}% a year", growth * 100.0),
                -1,
                vec![id.clone()],
            ));
        }
    }
    if let (Some(own), Some(id)) = (own_revenue.filter(|r| *r > 0.0), &own_id) {
        if let Some((rival, _, rival_id)) = competitors
            .iter()
            .find(|(_, revenue, _)| revenue.is_some_and(|r| r >= own * INCUMBENT_REVENUE_MULTIPLE))
        {
            factors.push(RiskFactor::new(
                format!("{rival} out-earns {name} at least tenfold"),
                1,
                vec![rival_id.clone(), id.clone()],
            ));
        }
    }
    if competitors.len() >= CROWDED_FIELD {
        factors.push(RiskFactor::new(
            format!("{} competitors on record", competitors.len()),
            1,
            competitors.iter().map(|(_, _, id)| id.clone()).collect(),
        ));
    }
    factors
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use diligence_state::{NewSession, SessionId, StartupProfile, TaskId};
    use serde_json::json;

    use crate::retrieval::evidence_id;

    fn row(key: &str, fields: serde_json::Value) -> EvidenceItem {
        let fields = match fields {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => Default::default(),
        };
        EvidenceItem {
            id: evidence_id(EvidenceSource::Structured, key),
            source_id: key.to_string(),
            source: EvidenceSource::Structured,
            score: 0.5,
            content: EvidenceContent::Row { fields },
            observed_at: None,
        }
    }

    fn record(items: Vec<EvidenceItem>) -> SessionRecord {
        let mut rec = SessionRecord::from_new(
            SessionId::new(),
            NewSession {
                profile: StartupProfile::new("Acme", "robotics", "acme-deck"),
                questions: vec![],
                tasks: vec![],
                deadline_at: Utc::now(),
                max_concurrent: 1,
            },
        );
        for item in items {
            rec.evidence.insert(item.id.clone(), item);
        }
        rec
    }

    fn section(kind: AgentKind, status: SectionStatus) -> Section {
        Section {
            kind,
            title: kind.title().to_string(),
            status,
            claims: vec![],
            gaps: Vec::<TaskId>::new(),
        }
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("14% CAGR"), Some(0.14));
        assert_eq!(parse_rate("0.4"), Some(0.4));
        assert_eq!(parse_rate("23"), Some(0.23));
        assert_eq!(parse_rate("steady"), None);
    }

    #[test]
    fn test_validated_market_lowers_risk() {
        let rec = record(vec![
            row(
                "market-robotics",
                json!({"industry": "Robotics", "market_size": "45B", "growth": "14% CAGR"}),
            ),
            row("acme", json!({"name": "Acme", "revenue": 1_200_000, "employee_growth": 0.4})),
        ]);
        let sections = vec![section(AgentKind::Summary, SectionStatus::Complete)];
        let rec_out = assess(&rec, &sections);

        assert!(rec_out.market.is_validated());
        assert_eq!(rec_out.market.market_size.as_deref(), Some("45B"));
        assert!(rec_out.market.commentary.contains("45B"));
        // 5 - market on record - fast growth - team growth
        assert_eq!(rec_out.risk_score, 2);
        assert_eq!(rec_out.verdict, Verdict::Pursue);
        assert!(rec_out
            .cited_ids()
            .all(|id| rec.evidence.contains_key(id)));
    }

    #[test]
    fn test_missing_sections_and_incumbents_raise_risk() {
        let rec = record(vec![
            row("acme", json!({"name": "Acme", "revenue": 1_000_000})),
            row("locus", json!({"name": "Locus", "revenue": 100_000_000})),
            row("botly", json!({"name": "Botly", "revenue": 5_000_000})),
            row("pickr", json!({"name": "Pickr"})),
        ]);
        let sections = vec![
            section(
                AgentKind::Summary,
                SectionStatus::InsufficientData {
                    reason: "timeout".to_string(),
                },
            ),
            section(
                AgentKind::Competitor,
                SectionStatus::InsufficientData {
                    reason: "timeout".to_string(),
                },
            ),
            section(AgentKind::Industry, SectionStatus::NoFinding),
        ];
        let out = assess(&rec, &sections);

        // 5 + summary 2 + competitor 1 + unverified market 1 + incumbent 1 + crowded 1
        assert_eq!(out.risk_score, MAX_RISK);
        assert_eq!(out.verdict, Verdict::Pass);
        assert!(!out.market.is_validated());
        assert!(out
            .factors
            .iter()
            .any(|f| f.description == "Locus out-earns Acme at least tenfold"));
    }

    #[test]
    fn test_verdict_thresholds() {
        assert_eq!(Verdict::from_risk(1), Verdict::Pursue);
        assert_eq!(Verdict::from_risk(5), Verdict::InvestigateFurther);
        assert_eq!(Verdict::from_risk(8), Verdict::Pass);
    }
}
