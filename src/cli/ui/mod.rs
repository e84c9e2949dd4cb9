mod catalog_view;
mod notice_view;
mod painter;
mod table;

pub(crate) use self::catalog_view::InspectReportView;
pub(crate) use self::notice_view::{ListenReadyView, ListenSummaryView, NoticeView, SendReportView};
pub(crate) use self::painter::Painter;
