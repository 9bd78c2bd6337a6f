pub mod invoice_settings;

use crate::mail_reader::invoice::invoice_settings::InvoiceClassifierSettings;
use log::debug;

fn contains_any(text: &str, words: &[String]) -> bool {
    words.iter().any(|word| text.contains(word.as_str()))
}

/// Heuristic "this might be an invoice" flag. False positives and negatives
/// are expected; downstream consumers make the final call.
#[derive(Debug, Clone, Default)]
pub struct InvoiceClassifier {
    settings: InvoiceClassifierSettings,
}

impl InvoiceClassifier {
    pub fn new(settings: InvoiceClassifierSettings) -> Self {
        InvoiceClassifier {
            settings: settings.normalized(),
        }
    }

    pub fn is_known_provider(&self, from_email: &str) -> bool {
        let address = from_email.to_lowercase();
        contains_any(&address, &self.settings.provider_domains)
    }

    pub fn is_possible_invoice(
        &self,
        subject: &str,
        snippet: &str,
        from_email: &str,
        has_attachments: bool,
    ) -> bool {
        if self.is_known_provider(from_email) {
            debug!("Sender {} is a known billing provider", from_email);
            return true;
        }

        let text = format!("{} {} {}", subject, snippet, from_email).to_lowercase();

        if has_attachments || contains_any(&text, &self.settings.attachment_indicators) {
            return contains_any(&text, &self.settings.invoice_keywords);
        }

        contains_any(&text, &self.settings.strong_keywords)
    }
}
