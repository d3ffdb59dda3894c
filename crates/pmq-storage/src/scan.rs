use pmq_core::MetricField;

/// Free-text columns that substring predicates may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextColumn {
    Title,
    Description,
    Slug,
    Domain,
    Section,
    Subsection,
}

impl TextColumn {
    pub fn column(self) -> &'static str {
        match self {
            TextColumn::Title => "title",
            TextColumn::Description => "description",
            TextColumn::Slug => "slug",
            TextColumn::Domain => "domain",
            TextColumn::Section => "section",
            TextColumn::Subsection => "subsection",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Active,
    /// Filter text that already passed the safety rewriter.
    Raw(String),
    /// Empty list matches every domain.
    DomainIn(Vec<String>),
    /// Case-insensitive substring match of any term in any column.
    AnyContains {
        columns: Vec<TextColumn>,
        terms: Vec<String>,
    },
    All(Vec<Predicate>),
    /// Disjunction; empty matches nothing.
    Any(Vec<Predicate>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderBy {
    /// Descending on the metric, then volume.
    Metric(MetricField),
    Raw(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanRequest {
    pub predicate: Option<Predicate>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl ScanRequest {
    pub fn active() -> Self {
        Self {
            predicate: Some(Predicate::Active),
            ..Default::default()
        }
    }

    /// AND another predicate onto the request.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            None => predicate,
            Some(Predicate::All(mut parts)) => {
                parts.push(predicate);
                Predicate::All(parts)
            }
            Some(existing) => Predicate::All(vec![existing, predicate]),
        });
        self
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
