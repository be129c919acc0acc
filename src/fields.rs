//! Structured document fields
//!
//! Every field is optional: an absent value means "unknown" and is never
//! conflated with zero. Field groups (vendor, customer, totals) are nested
//! structs so a partially recognised party stays distinguishable from a
//! missing one.

use serde::{Deserialize, Serialize};

/// Currencies the scoring and validation layers consider plausible
pub const KNOWN_CURRENCIES: &[&str] = &["CZK", "EUR", "USD", "GBP", "PLN", "HUF", "CHF"];

// ============================================================================
// Document Type
// ============================================================================

/// Kind of business document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Invoice,
    Receipt,
    CreditNote,
    Proforma,
    Order,
    Other,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Receipt => "receipt",
            Self::CreditNote => "credit_note",
            Self::Proforma => "proforma",
            Self::Order => "order",
            Self::Other => "other",
        }
    }

    /// Parse a document type name, accepting a few common spellings
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "invoice" | "faktura" => Some(Self::Invoice),
            "receipt" | "uctenka" | "účtenka" => Some(Self::Receipt),
            "credit_note" | "dobropis" => Some(Self::CreditNote),
            "proforma" | "proforma_invoice" | "zalohova_faktura" => Some(Self::Proforma),
            "order" | "purchase_order" | "objednavka" | "objednávka" => Some(Self::Order),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Receipts are processed at the point of sale, so routing favours fast tiers
    pub fn is_latency_sensitive(&self) -> bool {
        matches!(self, Self::Receipt)
    }

    /// Guess the document type from recognised text
    pub fn detect(text: &str) -> Option<Self> {
        let lower = text.to_lowercase();
        let has = |terms: &[&str]| terms.iter().any(|t| lower.contains(t));

        if has(&["credit note", "dobropis", "opravný daňový doklad"]) {
            Some(Self::CreditNote)
        } else if has(&["proforma", "zálohová faktura", "zalohova faktura"]) {
            Some(Self::Proforma)
        } else if has(&["invoice", "faktura", "daňový doklad"]) {
            Some(Self::Invoice)
        } else if has(&["receipt", "účtenka", "uctenka", "pokladní doklad"]) {
            Some(Self::Receipt)
        } else if has(&["purchase order", "objednávka", "objednavka"]) {
            Some(Self::Order)
        } else {
            None
        }
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Field Groups
// ============================================================================

/// A business party (vendor or customer)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// VAT identifier (e.g. CZ25596641)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_id: Option<String>,
    /// Company registration number (8-digit IČO)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<String>,
}

impl Party {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.tax_id.is_none() && self.registration_id.is_none()
    }
}

/// Monetary totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vat_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
}

impl Totals {
    pub fn is_empty(&self) -> bool {
        self.subtotal.is_none() && self.vat_amount.is_none() && self.total.is_none()
    }
}

/// One line of an invoice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// VAT rate in percent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vat_rate: Option<f64>,
}

impl LineItem {
    /// Line total, derived from quantity and unit price when not stated
    pub fn amount(&self) -> Option<f64> {
        self.total.or_else(|| match (self.quantity, self.unit_price) {
            (Some(q), Some(p)) => Some(q * p),
            _ => None,
        })
    }
}

// ============================================================================
// Structured Fields
// ============================================================================

/// Sparse record of the domain fields extracted from a document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<DocumentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<Party>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<Party>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totals: Option<Totals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub line_items: Vec<LineItem>,
}

/// Addressable scalar fields, used by consensus and fusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldKey {
    DocumentType,
    VendorName,
    VendorTaxId,
    VendorRegistrationId,
    CustomerName,
    CustomerTaxId,
    CustomerRegistrationId,
    Subtotal,
    VatAmount,
    Total,
    InvoiceNumber,
    Date,
    DueDate,
    Currency,
    BankAccount,
    VariableSymbol,
}

impl FieldKey {
    pub const ALL: [FieldKey; 16] = [
        FieldKey::DocumentType,
        FieldKey::VendorName,
        FieldKey::VendorTaxId,
        FieldKey::VendorRegistrationId,
        FieldKey::CustomerName,
        FieldKey::CustomerTaxId,
        FieldKey::CustomerRegistrationId,
        FieldKey::Subtotal,
        FieldKey::VatAmount,
        FieldKey::Total,
        FieldKey::InvoiceNumber,
        FieldKey::Date,
        FieldKey::DueDate,
        FieldKey::Currency,
        FieldKey::BankAccount,
        FieldKey::VariableSymbol,
    ];

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Subtotal | Self::VatAmount | Self::Total)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentType => "documentType",
            Self::VendorName => "vendor.name",
            Self::VendorTaxId => "vendor.taxId",
            Self::VendorRegistrationId => "vendor.registrationId",
            Self::CustomerName => "customer.name",
            Self::CustomerTaxId => "customer.taxId",
            Self::CustomerRegistrationId => "customer.registrationId",
            Self::Subtotal => "totals.subtotal",
            Self::VatAmount => "totals.vatAmount",
            Self::Total => "totals.total",
            Self::InvoiceNumber => "invoiceNumber",
            Self::Date => "date",
            Self::DueDate => "dueDate",
            Self::Currency => "currency",
            Self::BankAccount => "bankAccount",
            Self::VariableSymbol => "variableSymbol",
        }
    }
}

impl std::fmt::Display for FieldKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of a single scalar field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Amount(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_amount(&self) -> Option<f64> {
        match self {
            Self::Amount(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    /// Case- and whitespace-insensitive form used for grouping votes
    pub fn vote_key(&self) -> String {
        match self {
            Self::Amount(v) => format!("{:.2}", v),
            Self::Text(s) => s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase(),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Amount(v) => write!(f, "{:.2}", v),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl StructuredFields {
    /// Main monetary amount: total, else subtotal
    pub fn amount(&self) -> Option<f64> {
        self.totals.as_ref().and_then(|t| t.total.or(t.subtotal))
    }

    pub fn vendor_name(&self) -> Option<&str> {
        self.vendor.as_ref().and_then(|v| v.name.as_deref())
    }

    /// Read one scalar field
    pub fn get(&self, key: FieldKey) -> Option<FieldValue> {
        fn text(v: &Option<String>) -> Option<FieldValue> {
            v.clone().map(FieldValue::Text)
        }
        fn party_text(p: &Option<Party>, f: impl Fn(&Party) -> Option<&String>) -> Option<FieldValue> {
            p.as_ref().and_then(f).cloned().map(FieldValue::Text)
        }
        let amount = |f: fn(&Totals) -> Option<f64>| {
            self.totals.as_ref().and_then(f).map(FieldValue::Amount)
        };

        match key {
            FieldKey::DocumentType => self
                .document_type
                .map(|d| FieldValue::Text(d.as_str().to_string())),
            FieldKey::VendorName => party_text(&self.vendor, |p| p.name.as_ref()),
            FieldKey::VendorTaxId => party_text(&self.vendor, |p| p.tax_id.as_ref()),
            FieldKey::VendorRegistrationId => party_text(&self.vendor, |p| p.registration_id.as_ref()),
            FieldKey::CustomerName => party_text(&self.customer, |p| p.name.as_ref()),
            FieldKey::CustomerTaxId => party_text(&self.customer, |p| p.tax_id.as_ref()),
            FieldKey::CustomerRegistrationId => {
                party_text(&self.customer, |p| p.registration_id.as_ref())
            }
            FieldKey::Subtotal => amount(|t| t.subtotal),
            FieldKey::VatAmount => amount(|t| t.vat_amount),
            FieldKey::Total => amount(|t| t.total),
            FieldKey::InvoiceNumber => text(&self.invoice_number),
            FieldKey::Date => text(&self.date),
            FieldKey::DueDate => text(&self.due_date),
            FieldKey::Currency => text(&self.currency),
            FieldKey::BankAccount => text(&self.bank_account),
            FieldKey::VariableSymbol => text(&self.variable_symbol),
        }
    }

    /// Write one scalar field. Mismatched value kinds are ignored.
    pub fn set(&mut self, key: FieldKey, value: FieldValue) {
        match (key, value) {
            (FieldKey::DocumentType, FieldValue::Text(s)) => {
                self.document_type = DocumentType::parse(&s);
            }
            (FieldKey::VendorName, FieldValue::Text(s)) => {
                self.vendor.get_or_insert_with(Party::default).name = Some(s);
            }
            (FieldKey::VendorTaxId, FieldValue::Text(s)) => {
                self.vendor.get_or_insert_with(Party::default).tax_id = Some(s);
            }
            (FieldKey::VendorRegistrationId, FieldValue::Text(s)) => {
                self.vendor.get_or_insert_with(Party::default).registration_id = Some(s);
            }
            (FieldKey::CustomerName, FieldValue::Text(s)) => {
                self.customer.get_or_insert_with(Party::default).name = Some(s);
            }
            (FieldKey::CustomerTaxId, FieldValue::Text(s)) => {
                self.customer.get_or_insert_with(Party::default).tax_id = Some(s);
            }
            (FieldKey::CustomerRegistrationId, FieldValue::Text(s)) => {
                self.customer.get_or_insert_with(Party::default).registration_id = Some(s);
            }
            (FieldKey::Subtotal, FieldValue::Amount(v)) => {
                self.totals.get_or_insert_with(Totals::default).subtotal = Some(v);
            }
            (FieldKey::VatAmount, FieldValue::Amount(v)) => {
                self.totals.get_or_insert_with(Totals::default).vat_amount = Some(v);
            }
            (FieldKey::Total, FieldValue::Amount(v)) => {
                self.totals.get_or_insert_with(Totals::default).total = Some(v);
            }
            (FieldKey::InvoiceNumber, FieldValue::Text(s)) => self.invoice_number = Some(s),
            (FieldKey::Date, FieldValue::Text(s)) => self.date = Some(s),
            (FieldKey::DueDate, FieldValue::Text(s)) => self.due_date = Some(s),
            (FieldKey::Currency, FieldValue::Text(s)) => self.currency = Some(s),
            (FieldKey::BankAccount, FieldValue::Text(s)) => self.bank_account = Some(s),
            (FieldKey::VariableSymbol, FieldValue::Text(s)) => self.variable_symbol = Some(s),
            (key, value) => {
                tracing::debug!(field = %key, value = %value, "Ignoring field value of wrong kind");
            }
        }
    }

    /// Number of scalar fields present
    pub fn field_count(&self) -> usize {
        FieldKey::ALL.iter().filter(|k| self.get(**k).is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.field_count() == 0 && self.line_items.is_empty()
    }

    /// Drop empty nested groups so absent stays absent after edits
    pub fn prune(&mut self) {
        if self.vendor.as_ref().is_some_and(Party::is_empty) {
            self.vendor = None;
        }
        if self.customer.as_ref().is_some_and(Party::is_empty) {
            self.customer = None;
        }
        if self.totals.as_ref().is_some_and(Totals::is_empty) {
            self.totals = None;
        }
    }
}
