//! Upstream resolution over Google's DNS-over-HTTPS JSON endpoint.

use hickory_proto::rr::rdata::{A, AAAA, CNAME, NS, TXT};
use hickory_proto::rr::{Name, RData, Record};
use serde::Deserialize;

use std::str::FromStr;
use std::time::Duration;

use super::Error;

const ENDPOINT: &str = "https://dns.google.com/resolve";
// bound the serve loop's exposure to a slow upstream
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status", default)]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    name: String,
    #[serde(rename = "type")]
    rr_type: u16,
    #[serde(rename = "TTL", default)]
    ttl: u32,
    data: String,
}

pub struct UpstreamClient {
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        UpstreamClient {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Resolve `name`/`rr_type` upstream and translate whatever answers
    /// came back. Record types we do not speak are silently dropped.
    pub async fn resolve(&self, name: &str, rr_type: u16) -> Result<Vec<Record>, Error> {
        let rr_type_param = rr_type.to_string();
        let response = self
            .http
            .get(ENDPOINT)
            .query(&[("name", name), ("type", rr_type_param.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json::<DohResponse>()
            .await?;

        if response.status != 0 {
            tracing::debug!(status = response.status, %name, "upstream returned dns error status");
        }

        Ok(response.answer.iter().filter_map(answer_to_record).collect())
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

fn answer_to_record(answer: &DohAnswer) -> Option<Record> {
    let name = Name::from_str(&answer.name).ok()?;
    let rdata = match answer.rr_type {
        1 => RData::A(A(answer.data.parse().ok()?)),
        2 => RData::NS(NS(Name::from_str(&answer.data).ok()?)),
        5 => RData::CNAME(CNAME(Name::from_str(&answer.data).ok()?)),
        16 => RData::TXT(TXT::new(vec![answer.data.trim_matches('"').to_string()])),
        28 => RData::AAAA(AAAA(answer.data.parse().ok()?)),
        _ => return None,
    };
    Some(Record::from_rdata(name, answer.ttl, rdata))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{Ipv4Addr, Ipv6Addr};

    fn answer(rr_type: u16, data: &str) -> DohAnswer {
        DohAnswer {
            name: "example.com.".to_string(),
            rr_type,
            ttl: 300,
            data: data.to_string(),
        }
    }

    #[test]
    fn translates_known_record_types() {
        let a = answer_to_record(&answer(1, "93.184.216.34")).expect("a record");
        assert_eq!(a.data(), Some(&RData::A(A(Ipv4Addr::new(93, 184, 216, 34)))));
        assert_eq!(a.ttl(), 300);

        let aaaa = answer_to_record(&answer(28, "2606:2800:220:1::1")).expect("aaaa record");
        assert_eq!(
            aaaa.data(),
            Some(&RData::AAAA(AAAA("2606:2800:220:1::1".parse::<Ipv6Addr>().unwrap())))
        );

        let ns = answer_to_record(&answer(2, "ns1.example.com.")).expect("ns record");
        assert!(matches!(ns.data(), Some(RData::NS(_))));

        let cname = answer_to_record(&answer(5, "alias.example.com.")).expect("cname record");
        assert!(matches!(cname.data(), Some(RData::CNAME(_))));

        let txt = answer_to_record(&answer(16, "\"v=spf1 -all\"")).expect("txt record");
        assert_eq!(txt.data(), Some(&RData::TXT(TXT::new(vec!["v=spf1 -all".to_string()]))));
    }

    #[test]
    fn unknown_types_and_garbage_are_dropped() {
        // MX is not translated
        assert!(answer_to_record(&answer(15, "10 mail.example.com.")).is_none());
        // unparsable address
        assert!(answer_to_record(&answer(1, "not-an-ip")).is_none());
    }

    #[test]
    fn doh_payload_deserializes() -> anyhow::Result<()> {
        let payload = r#"{
            "Status": 0,
            "TC": false,
            "RD": true,
            "RA": true,
            "Answer": [
                {"name": "example.com.", "type": 1, "TTL": 1183, "data": "93.184.216.34"}
            ]
        }"#;
        let parsed: DohResponse = serde_json::from_str(payload)?;
        assert_eq!(parsed.status, 0);
        assert_eq!(parsed.answer.len(), 1);
        assert_eq!(parsed.answer[0].rr_type, 1);
        Ok(())
    }

    #[test]
    fn missing_answer_section_means_empty() -> anyhow::Result<()> {
        let parsed: DohResponse = serde_json::from_str(r#"{"Status": 3}"#)?;
        assert_eq!(parsed.status, 3);
        assert!(parsed.answer.is_empty());
        Ok(())
    }
}
