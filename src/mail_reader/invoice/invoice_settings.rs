use serde::Deserialize;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use anyhow::{Context, Result};
use backtrace::Backtrace;
use log::error;

const PROVIDER_DOMAINS: &[&str] = &[
    "netflix.com",
    "spotify.com",
    "amazon.com",
    "amazon.es",
    "apple.com",
    "paypal.com",
    "stripe.com",
    "paddle.com",
    "adobe.com",
    "dropbox.com",
    "github.com",
    "microsoft.com",
    "digitalocean.com",
    "hetzner.com",
    "ovh.com",
    "uber.com",
    "disneyplus.com",
    "hbomax.com",
    "movistar.es",
    "vodafone.es",
    "orange.es",
    "iberdrola.es",
    "endesa.es",
    "naturgy.com",
];

const INVOICE_KEYWORDS: &[&str] = &[
    "factura",
    "invoice",
    "recibo",
    "receipt",
    "pago",
    "payment",
    "cobro",
    "cargo",
    "importe",
    "total",
    "iva",
    "vat",
    "tax",
    "pedido",
    "order",
    "compra",
    "purchase",
    "suscripción",
    "subscription",
    "billing",
    "statement",
    "renovación",
    "renewal",
];

const ATTACHMENT_INDICATORS: &[&str] = &[".pdf", "adjunto", "attached"];

const STRONG_KEYWORDS: &[&str] = &[
    "factura",
    "invoice",
    "recibo",
    "receipt",
    "tu factura",
    "your invoice",
    "payment confirmation",
    "confirmación de pago",
];

/// Word tables used by the invoice classifier. Every entry is matched as a
/// lowercase substring.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct InvoiceClassifierSettings {
    pub provider_domains: Vec<String>,
    pub invoice_keywords: Vec<String>,
    pub attachment_indicators: Vec<String>,
    pub strong_keywords: Vec<String>,
}

fn owned(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

fn lowercased(words: Vec<String>) -> Vec<String> {
    words
        .into_iter()
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

impl Default for InvoiceClassifierSettings {
    fn default() -> Self {
        InvoiceClassifierSettings {
            provider_domains: owned(PROVIDER_DOMAINS),
            invoice_keywords: owned(INVOICE_KEYWORDS),
            attachment_indicators: owned(ATTACHMENT_INDICATORS),
            strong_keywords: owned(STRONG_KEYWORDS),
        }
    }
}

impl InvoiceClassifierSettings {
    pub fn normalized(self) -> Self {
        InvoiceClassifierSettings {
            provider_domains: lowercased(self.provider_domains),
            invoice_keywords: lowercased(self.invoice_keywords),
            attachment_indicators: lowercased(self.attachment_indicators),
            strong_keywords: lowercased(self.strong_keywords),
        }
    }
}

pub fn load_invoice_classifier_settings(path: &Path) -> Result<InvoiceClassifierSettings> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            error!("Error: {}", err);

            // Capture and print the backtrace
            let backtrace = Backtrace::new();
            error!("Backtrace:\n{:?}", backtrace);
            return Err(err).with_context(|| format!("Cannot find classifier settings {}", path.display()));
        }
    };

    let reader = BufReader::new(file);

    let settings: InvoiceClassifierSettings = serde_yaml::from_reader(reader)
        .with_context(|| format!("Cannot deserialize classifier settings {}", path.display()))?;

    Ok(settings.normalized())
}
